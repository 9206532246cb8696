use crate::CacheError;
use chrono::Utc;
use regex::Regex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, warn};

const FILE_PREFIX: &str = "cache";
const MAX_IO_RETRIES: u32 = 10;

static URL_EXTENSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\.[a-z]{1,5}\s*$").expect("Failed to compile url extension regex")
});

/// Response bodies stored as individual files in one directory.
///
/// Names are `cache<YYYYmmddHHMMSS><sequence>s<length><extension>`. The
/// sequence counts upwards until an exclusive create succeeds, so
/// concurrent writers never share a file.
#[derive(Debug, Clone)]
pub struct FileBodyStore {
    dir: PathBuf,
    write_disabled: bool,
}

impl FileBodyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_disabled: false,
        }
    }

    pub fn write_disabled(mut self, disabled: bool) -> Self {
        self.write_disabled = disabled;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `body` to a new uniquely named file and return its name.
    pub async fn save(
        &self,
        url: &str,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<String, CacheError> {
        if self.write_disabled {
            return Err(CacheError::FileWriteDisabled);
        }
        fs::create_dir_all(&self.dir).await?;

        let suffix = format!("s{}{}", body.len(), cache_extension(url, content_type));
        let (mut file, filename) = self.create_unique(&suffix).await?;

        let written = async {
            file.write_all(body).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(file = %filename, error = %e, "failed to write cache body");
            drop(file);
            self.discard(&filename).await;
            return Err(e.into());
        }

        debug!(file = %filename, bytes = body.len(), "cache body written");
        Ok(filename)
    }

    /// Remove a partially written body. Failures are logged, not returned.
    async fn discard(&self, filename: &str) -> bool {
        match fs::remove_file(self.dir.join(filename)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(file = %filename, error = %e, "rollback of partial cache body failed");
                false
            }
        }
    }

    async fn create_unique(&self, suffix: &str) -> Result<(fs::File, String), CacheError> {
        let base = format!("{FILE_PREFIX}{}", Utc::now().format("%Y%m%d%H%M%S"));
        let mut sequence = 0u64;
        let mut io_errors = 0;

        while io_errors < MAX_IO_RETRIES {
            sequence += 1;
            let filename = format!("{base}{sequence}{suffix}");
            let result = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.dir.join(&filename))
                .await;
            match result {
                Ok(file) => return Ok((file, filename)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    debug!(file = %filename, error = %e, "unique file create failed");
                    io_errors += 1;
                }
            }
        }

        Err(CacheError::NoUniqueFile(self.dir.display().to_string()))
    }

    pub async fn load(&self, filename: &str) -> Result<Vec<u8>, CacheError> {
        Ok(fs::read(self.dir.join(filename)).await?)
    }

    pub async fn delete(&self, filename: &str) -> Result<(), CacheError> {
        Ok(fs::remove_file(self.dir.join(filename)).await?)
    }

    /// Names of the regular files currently in the directory. A missing
    /// directory is an empty list.
    pub async fn list(&self) -> Result<Vec<String>, CacheError> {
        let mut names = Vec::new();
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(item) = dir.next_entry().await? {
            if item.file_type().await?.is_file() {
                names.push(item.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }
}

/// Extension for a stored body, including the leading dot: taken from the
/// url when it ends in one, otherwise derived from the content type.
pub fn cache_extension(url: &str, content_type: Option<&str>) -> String {
    if let Some(m) = URL_EXTENSION.find(url) {
        return m.as_str().trim_end().to_string();
    }

    let ct = content_type.unwrap_or_default().to_lowercase();
    let ext = if ct.contains("text/xml") {
        ".xml"
    } else if ct.contains("text/css") {
        ".css"
    } else if ct.contains("/x-javascript") || ct.contains("/javascript") {
        ".js"
    } else if ct.contains("image/png") {
        ".png"
    } else if ct.contains("image/gif") {
        ".gif"
    } else if ct.contains("image/jpeg") || ct.contains("image/jpg") {
        ".jpg"
    } else if ct.contains("text/html") {
        ".htm"
    } else {
        ".cae"
    };
    ext.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_extension_from_url() {
        assert_eq!(cache_extension("/content/logo.PNG", None), ".PNG");
        assert_eq!(cache_extension("/content/site.css  ", Some("text/plain")), ".css");
        assert_eq!(cache_extension("/content/archive.tar.gz", None), ".gz");
    }

    #[test]
    fn test_extension_from_content_type() {
        let cases = [
            ("text/xml; charset=utf-8", ".xml"),
            ("application/x-javascript", ".js"),
            ("text/javascript", ".js"),
            ("image/jpg", ".jpg"),
            ("image/gif", ".gif"),
            ("text/html", ".htm"),
            ("application/octet-stream", ".cae"),
        ];
        for (ct, ext) in cases {
            assert_eq!(cache_extension("/plugin/zone?zoneid=3", Some(ct)), ext, "{ct}");
        }
        assert_eq!(cache_extension("/plugin/zone", None), ".cae");
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let dir = tempdir().unwrap();
        let store = FileBodyStore::new(dir.path().join("cachedata"));

        let name = store
            .save("/content/x.png", Some("image/png"), b"\x89PNG")
            .await
            .unwrap();
        assert!(name.starts_with("cache"));
        assert!(name.ends_with("1s4.png"));
        assert_eq!(store.load(&name).await.unwrap(), b"\x89PNG");
        assert_eq!(store.list().await.unwrap(), vec![name.clone()]);

        store.delete(&name).await.unwrap();
        assert!(store.load(&name).await.is_err());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_names_are_unique() {
        let dir = tempdir().unwrap();
        let store = FileBodyStore::new(dir.path());

        let mut names = Vec::new();
        for _ in 0..5 {
            names.push(store.save("/content/a.css", None, b"a{}").await.unwrap());
        }
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 5);
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_collide() {
        let dir = tempdir().unwrap();
        let store = FileBodyStore::new(dir.path());

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.save("/content/c.js", None, &[i]).await.unwrap()
            }));
        }
        let mut names = Vec::new();
        for handle in handles {
            names.push(handle.await.unwrap());
        }
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 8);
    }

    #[tokio::test]
    async fn test_discard_reports_rollback_failure() {
        let dir = tempdir().unwrap();
        let store = FileBodyStore::new(dir.path());
        let name = store.save("/content/p.css", None, b"partial").await.unwrap();

        assert!(store.discard(&name).await);
        assert!(store.list().await.unwrap().is_empty());
        assert!(!store.discard(&name).await);
    }

    #[tokio::test]
    async fn test_disabled_writes_and_missing_dir() {
        let dir = tempdir().unwrap();
        let store = FileBodyStore::new(dir.path().join("nope")).write_disabled(true);

        let result = store.save("/content/a", None, b"x").await;
        assert!(matches!(result, Err(CacheError::FileWriteDisabled)));
        assert!(store.list().await.unwrap().is_empty());
    }
}
