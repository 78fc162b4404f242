use super::{EngineError, EngineResult};
use serde::Deserialize;

const VERSION_MANIFEST_URL: &str =
    "https://piston-meta.mojang.com/mc/game/version_manifest_v2.json";

#[derive(Debug, Clone, Deserialize)]
pub struct VersionManifest {
    pub latest: LatestVersions,
    pub versions: Vec<VersionEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LatestVersions {
    pub release: String,
    pub snapshot: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct VersionDetails {
    downloads: VersionDownloads,
}

#[derive(Debug, Deserialize)]
struct VersionDownloads {
    server: Option<Download>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Download {
    pub url: String,
    pub size: u64,
}

impl VersionManifest {
    pub async fn fetch(client: &reqwest::Client) -> EngineResult<Self> {
        Ok(client
            .get(VERSION_MANIFEST_URL)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    pub fn find(&self, id: &str) -> EngineResult<&VersionEntry> {
        self.versions
            .iter()
            .find(|v| v.id == id)
            .ok_or_else(|| EngineError::UnknownVersion(id.to_string()))
    }

    /// Looks up where the dedicated server jar for `id` can be downloaded.
    /// Very old releases never shipped one.
    pub async fn server_download(
        &self,
        client: &reqwest::Client,
        id: &str,
    ) -> EngineResult<Download> {
        let entry = self.find(id)?;
        let details: VersionDetails = client
            .get(&entry.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        details
            .downloads
            .server
            .ok_or_else(|| EngineError::UnknownVersion(format!("{} (no server download)", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest() -> VersionManifest {
        serde_json::from_value(json!({
            "latest": { "release": "1.21.4", "snapshot": "25w02a" },
            "versions": [
                {
                    "id": "25w02a",
                    "type": "snapshot",
                    "url": "https://piston-meta.mojang.com/v1/packages/aaa/25w02a.json",
                    "time": "2025-01-08T13:20:42+00:00",
                    "releaseTime": "2025-01-08T13:11:02+00:00",
                    "sha1": "aaa",
                    "complianceLevel": 1
                },
                {
                    "id": "1.21.4",
                    "type": "release",
                    "url": "https://piston-meta.mojang.com/v1/packages/bbb/1.21.4.json",
                    "time": "2024-12-03T10:24:48+00:00",
                    "releaseTime": "2024-12-03T10:12:57+00:00",
                    "sha1": "bbb",
                    "complianceLevel": 1
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn parses_latest_release() {
        let manifest = manifest();
        assert_eq!(manifest.latest.release, "1.21.4");
        assert_eq!(manifest.latest.snapshot, "25w02a");
    }

    #[test]
    fn finds_versions_by_id() {
        let manifest = manifest();
        let entry = manifest.find("1.21.4").unwrap();
        assert_eq!(entry.kind, "release");
        assert!(entry.url.ends_with("1.21.4.json"));
    }

    #[test]
    fn unknown_version_is_reported() {
        let err = manifest().find("0.0.1").unwrap_err();
        assert!(matches!(err, EngineError::UnknownVersion(v) if v == "0.0.1"));
    }

    #[test]
    fn version_details_without_server_download() {
        let details: VersionDetails = serde_json::from_value(json!({
            "downloads": { "client": { "url": "https://example.invalid/client.jar", "size": 1, "sha1": "c" } }
        }))
        .unwrap();
        assert!(details.downloads.server.is_none());
    }
}
