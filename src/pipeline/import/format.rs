use std::path::Path;

use serde::{Deserialize, Serialize};

use super::ImportError;

/// Extensions accepted at upload.
pub const ALLOWED_EXTENSIONS: &[&str] = &["pdf", "docx", "xlsx", "txt", "md"];

/// Broad file categories we handle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FileCategory {
    Pdf,
    OfficeDocument,
    PlainText,
}

impl FileCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::OfficeDocument => "office_document",
            Self::PlainText => "plain_text",
        }
    }
}

/// Result of format detection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormatDetection {
    pub mime_type: String,
    pub category: FileCategory,
    pub extension: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signature {
    Pdf,
    Zip,
    Other,
}

fn signature(bytes: &[u8]) -> Signature {
    match bytes {
        // PDF: starts with %PDF
        [0x25, 0x50, 0x44, 0x46, ..] => Signature::Pdf,
        // ZIP container (docx, xlsx): PK\x03\x04
        [0x50, 0x4B, 0x03, 0x04, ..] => Signature::Zip,
        _ => Signature::Other,
    }
}

/// Lowercased extension of `filename`, without the dot.
pub fn file_extension(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Detect the format from magic bytes and check it against the extension.
///
/// The extension must be on the allow-list. A PDF signature behind any other
/// extension, or a `.pdf` without one, is rejected; so are Office extensions
/// that are not ZIP containers.
pub fn detect_format(bytes: &[u8], filename: &str) -> Result<FormatDetection, ImportError> {
    let extension = file_extension(filename)
        .filter(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
        .ok_or_else(|| {
            ImportError::UnsupportedFormat(format!(
                "'{filename}' (allowed: {})",
                ALLOWED_EXTENSIONS.join(", ")
            ))
        })?;

    let sig = signature(bytes);
    let category = match (extension.as_str(), sig) {
        ("pdf", Signature::Pdf) => FileCategory::Pdf,
        ("pdf", _) => {
            return Err(ImportError::FormatMismatch(format!("'{filename}' is not a PDF")));
        }
        (_, Signature::Pdf) => {
            return Err(ImportError::FormatMismatch(format!("'{filename}' contains a PDF")));
        }
        ("docx" | "xlsx", Signature::Zip) => FileCategory::OfficeDocument,
        ("docx" | "xlsx", _) => {
            return Err(ImportError::FormatMismatch(format!(
                "'{filename}' is not an Office Open XML file"
            )));
        }
        (_, Signature::Zip) => {
            return Err(ImportError::FormatMismatch(format!("'{filename}' is an archive")));
        }
        _ => FileCategory::PlainText,
    };

    let mime_type = match (category, extension.as_str()) {
        (FileCategory::Pdf, _) => "application/pdf".to_string(),
        (FileCategory::PlainText, "md") => "text/markdown".to_string(),
        (FileCategory::PlainText, _) => "text/plain".to_string(),
        (FileCategory::OfficeDocument, _) => mime_guess::from_path(filename)
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_string(),
    };

    Ok(FormatDetection {
        mime_type,
        category,
        extension,
    })
}

/// Sanitize a filename: strip path components, limit length
pub fn sanitize_filename(original: &str) -> String {
    let name = Path::new(original)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");

    let clean: String = name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | '\0'))
        .take(255)
        .collect();

    if clean.is_empty() {
        "document".to_string()
    } else {
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_pdf_from_magic_bytes() {
        let format = detect_format(b"%PDF-1.7\n...", "Spec.PDF").unwrap();
        assert_eq!(format.category, FileCategory::Pdf);
        assert_eq!(format.mime_type, "application/pdf");
        assert_eq!(format.extension, "pdf");
    }

    #[test]
    fn docx_uses_extension_mime() {
        let format = detect_format(b"PK\x03\x04rest", "tender.docx").unwrap();
        assert_eq!(format.category, FileCategory::OfficeDocument);
        assert!(format.mime_type.starts_with("application/vnd.openxmlformats"));
    }

    #[test]
    fn text_and_markdown() {
        assert_eq!(detect_format(b"hello", "notes.txt").unwrap().mime_type, "text/plain");
        assert_eq!(detect_format(b"# Title", "readme.md").unwrap().mime_type, "text/markdown");
    }

    #[test]
    fn extension_not_allowed() {
        let err = detect_format(b"MZ\x90\x00", "setup.exe").unwrap_err();
        assert!(matches!(err, ImportError::UnsupportedFormat(_)));
        let err = detect_format(b"data", "no_extension").unwrap_err();
        assert!(matches!(err, ImportError::UnsupportedFormat(_)));
    }

    #[test]
    fn pdf_signature_mismatch_rejected_both_ways() {
        let err = detect_format(b"%PDF-1.4", "renamed.txt").unwrap_err();
        assert!(matches!(err, ImportError::FormatMismatch(_)));
        let err = detect_format(b"plain words", "fake.pdf").unwrap_err();
        assert!(matches!(err, ImportError::FormatMismatch(_)));
    }

    #[test]
    fn office_extension_requires_zip() {
        let err = detect_format(b"not a zip", "sheet.xlsx").unwrap_err();
        assert!(matches!(err, ImportError::FormatMismatch(_)));
    }

    #[test]
    fn sanitize_strips_path_components() {
        assert_eq!(sanitize_filename("../../etc/passwd.txt"), "passwd.txt");
        assert_eq!(sanitize_filename("C:\\docs\\spec.pdf").contains('\\'), false);
        assert_eq!(sanitize_filename(""), "document");
    }
}
