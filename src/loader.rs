//! Document loading: raw files to normalized plain text.
//!
//! The format is detected from the file extension. Each format has its own
//! normalizer, and every normalizer finishes with the same cleanup: line
//! endings become `\n`, trailing whitespace is trimmed per line, and runs of
//! three or more newlines collapse to one paragraph break.
//!
//! | Format | Extensions | Extraction |
//! |--------|------------|------------|
//! | Markdown | `.md`, `.markdown` | markup stripped, structure kept as text |
//! | Word | `.docx` | `word/document.xml` via `zip` + `quick-xml` |
//! | PDF | `.pdf` | `pdf-extract` |
//!
//! Loading never modifies the source file. Failures are reported as
//! [`Error::UnsupportedFormat`] or [`Error::CorruptDocument`] so the
//! synchronizer can skip the document and continue.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use docsage_core::models::{sha256_hex, DocumentFormat};
use docsage_core::{Error, Result};
use quick_xml::events::Event;
use regex::{Captures, Regex};

/// Maximum decompressed bytes to read from `word/document.xml` (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

static HTML_COMMENT: LazyLock<Regex> = LazyLock::new(|| match Regex::new(r"(?s)<!--.*?-->") {
    Ok(regex) => regex,
    Err(err) => panic!("HTML comment regex is invalid: {err}"),
});

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| match Regex::new(r"^ {0,3}#{1,6}(?:[ \t]+(.*?))?(?:[ \t]+#+)?[ \t]*$") {
        Ok(regex) => regex,
        Err(err) => panic!("Heading regex is invalid: {err}"),
    });

static IMAGE: LazyLock<Regex> = LazyLock::new(|| match Regex::new(r"!\[([^\]]*)\]\([^)]*\)") {
    Ok(regex) => regex,
    Err(err) => panic!("Image regex is invalid: {err}"),
});

static LINK: LazyLock<Regex> = LazyLock::new(|| match Regex::new(r"\[([^\]]*)\]\([^)]*\)") {
    Ok(regex) => regex,
    Err(err) => panic!("Link regex is invalid: {err}"),
});

static BLANK_RUN: LazyLock<Regex> = LazyLock::new(|| match Regex::new(r"\n{3,}") {
    Ok(regex) => regex,
    Err(err) => panic!("Blank-run regex is invalid: {err}"),
});

/// A document read from disk and reduced to plain text.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub path: PathBuf,
    pub format: DocumentFormat,
    /// SHA-256 of the raw bytes that were read.
    pub content_hash: String,
    /// Normalized text; empty when the document carries no text.
    pub text: String,
}

/// Detect the format of `path` from its extension.
pub fn detect_format(path: &Path) -> Result<DocumentFormat> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(DocumentFormat::from_extension)
        .ok_or_else(|| Error::UnsupportedFormat {
            path: path.to_path_buf(),
        })
}

/// Read and normalize one document.
///
/// Files larger than `max_file_bytes` are rejected as corrupt without
/// being read in full.
pub fn load_document(path: &Path, max_file_bytes: u64) -> Result<LoadedDocument> {
    let format = detect_format(path)?;
    let bytes = read_bounded(path, max_file_bytes)?;
    let text = normalize_bytes(path, format, &bytes)?;

    Ok(LoadedDocument {
        path: path.to_path_buf(),
        format,
        content_hash: sha256_hex(&bytes),
        text,
    })
}

/// Normalize already-read bytes of a known format.
pub fn normalize_bytes(path: &Path, format: DocumentFormat, bytes: &[u8]) -> Result<String> {
    if bytes.is_empty() {
        return Ok(String::new());
    }
    match format {
        DocumentFormat::Markdown => {
            let text = std::str::from_utf8(bytes)
                .map_err(|e| Error::corrupt(path, format!("not valid UTF-8: {e}")))?;
            Ok(normalize_markdown(text))
        }
        DocumentFormat::Word => {
            let title = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            extract_docx(bytes, &title).map_err(|reason| Error::corrupt(path, reason))
        }
        DocumentFormat::Pdf => extract_pdf(bytes).map_err(|reason| Error::corrupt(path, reason)),
    }
}

fn read_bounded(path: &Path, max_file_bytes: u64) -> Result<Vec<u8>> {
    let io_err = |source| Error::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = std::fs::File::open(path).map_err(io_err)?;
    let len = file.metadata().map_err(io_err)?.len();
    if len > max_file_bytes {
        return Err(Error::corrupt(
            path,
            format!("file is {len} bytes, limit is {max_file_bytes}"),
        ));
    }

    let mut bytes = Vec::with_capacity(len as usize);
    file.take(max_file_bytes + 1)
        .read_to_end(&mut bytes)
        .map_err(io_err)?;
    if bytes.len() as u64 > max_file_bytes {
        return Err(Error::corrupt(
            path,
            format!("file grew past the {max_file_bytes} byte limit while reading"),
        ));
    }
    Ok(bytes)
}

/// Strip Markdown markup while keeping the text a reader would see.
pub fn normalize_markdown(input: &str) -> String {
    let input = input.trim_start_matches('\u{feff}').replace("\r\n", "\n");
    let input = HTML_COMMENT.replace_all(&input, "");

    let mut lines: Vec<String> = Vec::new();
    let mut in_fence = false;

    for line in input.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            lines.push(line.to_string());
            continue;
        }
        if is_table_separator(trimmed) {
            continue;
        }

        let mut text = match HEADING.captures(line) {
            Some(caps) => caps.get(1).map_or("", |m| m.as_str()).to_string(),
            None => line.to_string(),
        };

        if text.trim_start().starts_with('|') {
            text = linearize_table_row(&text);
        }

        let text = IMAGE.replace_all(&text, |caps: &Captures| {
            let alt = caps[1].trim();
            if alt.is_empty() {
                "[image]".to_string()
            } else {
                format!("[image: {alt}]")
            }
        });
        let text = LINK.replace_all(&text, "$1");
        lines.push(text.into_owned());
    }

    finish(&lines.join("\n"))
}

fn is_table_separator(line: &str) -> bool {
    line.contains('|')
        && line.contains("---")
        && line.chars().all(|c| matches!(c, '|' | '-' | ':' | ' ' | '\t'))
}

fn linearize_table_row(line: &str) -> String {
    let inner = line.trim();
    let inner = inner.strip_prefix('|').unwrap_or(inner);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    inner
        .split('|')
        .map(str::trim)
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Shared final cleanup for every format.
fn finish(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let trimmed_lines = text
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    BLANK_RUN
        .replace_all(&trimmed_lines, "\n\n")
        .trim_matches('\n')
        .to_string()
}

#[derive(Default)]
struct DocxState {
    paragraphs: Vec<String>,
    paragraph: String,
    in_text: bool,
    table_depth: usize,
    row: Vec<String>,
    cell: Option<String>,
}

impl DocxState {
    fn push_inline(&mut self, s: &str) {
        self.paragraph.push_str(s);
    }

    fn push_image(&mut self) {
        if !self.paragraph.is_empty() && !self.paragraph.ends_with(char::is_whitespace) {
            self.paragraph.push(' ');
        }
        self.paragraph.push_str("[image]");
    }

    fn end_paragraph(&mut self) {
        let text = std::mem::take(&mut self.paragraph);
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        match self.cell.as_mut() {
            Some(cell) => {
                if !cell.is_empty() {
                    cell.push(' ');
                }
                cell.push_str(text);
            }
            None => self.paragraphs.push(text.to_string()),
        }
    }
}

/// Extract paragraph text from a `.docx` archive.
///
/// The first paragraph of the result is `title` (the file stem) unless the
/// document has no text at all, in which case the result is empty.
pub fn extract_docx(bytes: &[u8], title: &str) -> std::result::Result<String, String> {
    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| e.to_string())?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| "word/document.xml not found".to_string())?;
    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| e.to_string())?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err("word/document.xml exceeds size limit".to_string());
    }

    let body = extract_word_paragraphs(&xml)?;
    if body.is_empty() {
        return Ok(String::new());
    }

    let title = title.trim();
    let mut out = String::new();
    if !title.is_empty() {
        out.push_str(title);
        out.push_str("\n\n");
    }
    out.push_str(&body.join("\n\n"));
    Ok(finish(&out))
}

fn extract_word_paragraphs(xml: &[u8]) -> std::result::Result<Vec<String>, String> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut state = DocxState::default();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"t" => state.in_text = true,
                b"tab" => state.push_inline(" "),
                b"br" | b"cr" => state.push_inline("\n"),
                b"drawing" | b"pict" => state.push_image(),
                b"tbl" => state.table_depth += 1,
                b"tr" if state.table_depth == 1 => state.row.clear(),
                b"tc" if state.table_depth == 1 => state.cell = Some(String::new()),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => state.push_inline(" "),
                b"br" | b"cr" => state.push_inline("\n"),
                b"drawing" | b"pict" => state.push_image(),
                b"p" => state.end_paragraph(),
                _ => {}
            },
            Ok(Event::Text(te)) if state.in_text => {
                let text = te.unescape().map_err(|e| e.to_string())?;
                state.push_inline(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => state.in_text = false,
                b"p" => state.end_paragraph(),
                b"tc" if state.table_depth == 1 => {
                    state.end_paragraph();
                    if let Some(cell) = state.cell.take() {
                        state.row.push(cell);
                    }
                }
                b"tr" if state.table_depth == 1 => {
                    let row = std::mem::take(&mut state.row);
                    if row.iter().any(|c| !c.is_empty()) {
                        state.paragraphs.push(row.join(" | "));
                    }
                }
                b"tbl" => state.table_depth = state.table_depth.saturating_sub(1),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("malformed word/document.xml: {e}")),
            _ => {}
        }
        buf.clear();
    }

    Ok(state.paragraphs)
}

/// Extract text from a PDF. `pdf-extract` panics on some malformed input,
/// so panics are reported as extraction failures.
pub fn extract_pdf(bytes: &[u8]) -> std::result::Result<String, String> {
    let extracted = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
        .map_err(|_| "PDF parser panicked".to_string())?
        .map_err(|e| format!("PDF extraction failed: {e}"))?;
    Ok(finish(&extracted.replace('\u{c}', "\n\n")))
}
