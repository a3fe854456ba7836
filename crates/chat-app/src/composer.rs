use std::path::{Path, PathBuf};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use ikiganiro_llm::ChatFile;
use snafu::{OptionExt, ResultExt, Snafu, ensure};

/// Inline data the remote API accepts per request is capped well below this.
pub const MAX_ATTACHMENT_BYTES: u64 = 20 * 1024 * 1024;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ComposerError {
    #[snafu(display("failed to read attachment {path:?} on `{stage}`: {source}"))]
    ReadAttachment {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("attachment {path:?} is {size} bytes, over the {limit} byte limit"))]
    AttachmentTooLarge {
        stage: &'static str,
        path: PathBuf,
        size: u64,
        limit: u64,
    },
    #[snafu(display("attachment path {path:?} has no file name"))]
    AttachmentName { stage: &'static str, path: PathBuf },
}

/// Reads `path` into an inline [`ChatFile`].
pub async fn read_attachment(path: &Path) -> Result<ChatFile, ComposerError> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.is_empty())
        .context(AttachmentNameSnafu {
            stage: "attachment-name",
            path: path.to_path_buf(),
        })?;

    let metadata = tokio::fs::metadata(path).await.context(ReadAttachmentSnafu {
        stage: "attachment-metadata",
        path: path.to_path_buf(),
    })?;
    ensure!(
        metadata.len() <= MAX_ATTACHMENT_BYTES,
        AttachmentTooLargeSnafu {
            stage: "attachment-size",
            path: path.to_path_buf(),
            size: metadata.len(),
            limit: MAX_ATTACHMENT_BYTES,
        }
    );

    let bytes = tokio::fs::read(path).await.context(ReadAttachmentSnafu {
        stage: "attachment-read",
        path: path.to_path_buf(),
    })?;

    let mime_type = guess_mime_type(path);
    tracing::debug!(
        path = ?path,
        mime_type,
        size = bytes.len(),
        "attached file"
    );

    Ok(ChatFile::new(name, mime_type, BASE64_STANDARD.encode(bytes)))
}

pub fn guess_mime_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|extension| extension.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "pdf" => "application/pdf",
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

/// Multi-line input buffer: a line ending in `\` continues onto the next one.
#[derive(Debug, Default)]
pub struct LineComposer {
    lines: Vec<String>,
}

impl LineComposer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_continuing(&self) -> bool {
        !self.lines.is_empty()
    }

    /// Feeds one input line; returns the full text once it is complete.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(continued) = line.strip_suffix('\\') {
            self.lines.push(continued.to_string());
            return None;
        }

        self.lines.push(line.to_string());
        Some(std::mem::take(&mut self.lines).join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backslash_continues_onto_next_line() {
        let mut composer = LineComposer::new();
        assert_eq!(composer.push_line("Muraho\\"), None);
        assert!(composer.is_continuing());
        assert_eq!(composer.push_line("amakuru?\\\n"), None);
        assert_eq!(
            composer.push_line("ni meza"),
            Some("Muraho\namakuru?\nni meza".to_string())
        );
        assert!(!composer.is_continuing());
        assert_eq!(composer.push_line("bye\r\n"), Some("bye".to_string()));
    }

    #[test]
    fn mime_type_follows_extension_case_insensitively() {
        assert_eq!(guess_mime_type(Path::new("a/ifoto.PNG")), "image/png");
        assert_eq!(guess_mime_type(Path::new("raporo.pdf")), "application/pdf");
        assert_eq!(guess_mime_type(Path::new("README")), "application/octet-stream");
    }

    #[tokio::test]
    async fn attachment_is_base64_encoded() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("inyandiko.txt");
        std::fs::write(&path, b"Muraho").expect("fixture written");

        let file = read_attachment(&path).await.expect("attachment reads");
        assert_eq!(file.name, "inyandiko.txt");
        assert_eq!(file.mime_type, "text/plain");
        assert_eq!(file.data, "TXVyYWhv");
    }

    #[tokio::test]
    async fn missing_attachment_is_reported() {
        let dir = tempfile::tempdir().expect("temp dir");
        let error = read_attachment(&dir.path().join("absent.png"))
            .await
            .expect_err("missing file fails");
        assert!(matches!(error, ComposerError::ReadAttachment { .. }));
    }
}
