//! Fetches an API artifact (zip containing a YAML spec) from the
//! management plane's REST surface and extracts the embedded YAML.

use std::io::{Cursor, Read};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("artifact returned non-success status {0}")]
    Status(reqwest::StatusCode),

    #[error("invalid zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("archive contains no .yaml entry")]
    NoYamlEntry,

    #[error("io error reading archive entry: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ArtifactClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ArtifactClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, tls_verify: bool) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(!tls_verify)
            .build()
            .expect("reqwest client builds with static config");

        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// `GET /apis/{id}/artifact`, returning the bytes of the first
    /// `.yaml` entry in the response zip.
    pub async fn fetch_yaml(&self, api_id: &str) -> Result<String, ArtifactError> {
        let url = format!("{}/apis/{}/artifact", self.base_url, api_id);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ArtifactError::Status(response.status()));
        }

        let bytes = response.bytes().await?;
        extract_first_yaml(&bytes)
    }
}

fn extract_first_yaml(zip_bytes: &[u8]) -> Result<String, ArtifactError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(zip_bytes))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.name().ends_with(".yaml") || entry.name().ends_with(".yml") {
            let mut contents = String::new();
            entry.read_to_string(&mut contents)?;
            return Ok(contents);
        }
    }

    Err(ArtifactError::NoYamlEntry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_zip_with_entry(name: &str, contents: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buf));
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file(name, options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn extracts_first_yaml_entry() {
        let zip_bytes = build_zip_with_entry("api.yaml", "kind: RestApi\n");
        let yaml = extract_first_yaml(&zip_bytes).unwrap();
        assert_eq!(yaml, "kind: RestApi\n");
    }

    #[test]
    fn missing_yaml_entry_errors() {
        let zip_bytes = build_zip_with_entry("readme.txt", "hello");
        assert!(matches!(
            extract_first_yaml(&zip_bytes),
            Err(ArtifactError::NoYamlEntry)
        ));
    }
}
