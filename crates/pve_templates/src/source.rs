//! Parsed JSON documents with line information.
//!
//! `serde_json::Value` drops positions, so every document keeps a
//! [`SourceMap`] from JSON pointer to the 1-based line its value starts on.
//! Validation errors and resolution errors use it to point at the offending
//! value in the original file.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ErrorDetail;

/// Line lookup by JSON pointer.
#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    lines: HashMap<String, usize>,
}

impl SourceMap {
    /// Scan `text` once and record where each value starts.
    ///
    /// Malformed input stops the scan; whatever was recorded so far is kept.
    pub fn build(text: &str) -> Self {
        let mut scanner = Scanner {
            bytes: text.as_bytes(),
            pos: 0,
            line: 1,
            lines: HashMap::new(),
        };
        let _ = scanner.value(String::new());
        Self {
            lines: scanner.lines,
        }
    }

    /// Line of the value at `pointer`, or of its closest recorded ancestor.
    pub fn line_for(&self, pointer: &str) -> Option<usize> {
        let mut current = pointer;
        loop {
            if let Some(line) = self.lines.get(current) {
                return Some(*line);
            }
            let cut = current.rfind('/')?;
            current = &current[..cut];
        }
    }
}

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
    line: usize,
    lines: HashMap<String, usize>,
}

impl<'a> Scanner<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        if byte == b'\n' {
            self.line += 1;
        }
        Some(byte)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.bump();
        }
    }

    fn value(&mut self, pointer: String) -> Option<()> {
        self.skip_whitespace();
        let first = self.peek()?;
        self.lines.insert(pointer.clone(), self.line);
        match first {
            b'{' => self.object(&pointer),
            b'[' => self.array(&pointer),
            b'"' => self.string().map(|_| ()),
            _ => {
                while let Some(byte) = self.peek() {
                    if matches!(byte, b',' | b'}' | b']') || byte.is_ascii_whitespace() {
                        break;
                    }
                    self.bump();
                }
                Some(())
            }
        }
    }

    fn object(&mut self, pointer: &str) -> Option<()> {
        self.bump();
        loop {
            self.skip_whitespace();
            match self.peek()? {
                b'}' => {
                    self.bump();
                    return Some(());
                }
                b',' => {
                    self.bump();
                }
                b'"' => {
                    let key = self.string()?;
                    self.skip_whitespace();
                    if self.bump()? != b':' {
                        return None;
                    }
                    self.value(format!("{}/{}", pointer, escape_pointer(&key)))?;
                }
                _ => return None,
            }
        }
    }

    fn array(&mut self, pointer: &str) -> Option<()> {
        self.bump();
        let mut index = 0usize;
        loop {
            self.skip_whitespace();
            match self.peek()? {
                b']' => {
                    self.bump();
                    return Some(());
                }
                b',' => {
                    self.bump();
                }
                _ => {
                    self.value(format!("{}/{}", pointer, index))?;
                    index += 1;
                }
            }
        }
    }

    /// Consume a string literal and return its decoded contents.
    fn string(&mut self) -> Option<String> {
        let start = self.pos;
        self.bump();
        let mut escaped = false;
        loop {
            let byte = self.bump()?;
            if escaped {
                escaped = false;
                continue;
            }
            match byte {
                b'\\' => escaped = true,
                b'"' => break,
                _ => {}
            }
        }
        serde_json::from_slice(self.bytes.get(start..self.pos)?).ok()
    }
}

/// Escape a key as a JSON pointer reference token.
fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// A JSON file parsed into a value plus its source map.
#[derive(Debug, Clone)]
pub struct JsonDocument {
    pub path: PathBuf,
    pub text: String,
    pub value: Value,
    pub source_map: SourceMap,
}

impl JsonDocument {
    /// Parse `text`; syntax errors carry serde's line number.
    pub fn parse(path: impl Into<PathBuf>, text: impl Into<String>) -> Result<Self, ErrorDetail> {
        let path = path.into();
        let text = text.into();
        let value: Value = serde_json::from_str(&text).map_err(|e| {
            ErrorDetail::new(format!("Invalid JSON: {}", e)).at(&path, Some(e.line()))
        })?;
        let source_map = SourceMap::build(&text);
        Ok(Self {
            path,
            text,
            value,
            source_map,
        })
    }

    pub fn line_for(&self, pointer: &str) -> Option<usize> {
        self.source_map.line_for(pointer)
    }

    /// Deserialize from the original text so type errors keep their line.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, ErrorDetail> {
        serde_json::from_str(&self.text).map_err(|e| {
            ErrorDetail::new(format!("Invalid document: {}", e))
                .at(&self.path, (e.line() > 0).then(|| e.line()))
        })
    }

    /// Detail located at `pointer` in this document.
    pub fn detail_at(&self, pointer: &str, message: impl Into<String>) -> ErrorDetail {
        ErrorDetail::new(message).at(&self.path, self.line_for(pointer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = r#"{
  "execute_on": "ve",
  "name": "Install",
  "commands": [
    { "command": "echo {{ hostname }}" },
    {
      "script": "setup.sh",
      "outputs": ["vm_id"]
    }
  ],
  "a/b": { "x~y": 1 }
}"#;

    #[test]
    fn test_lines_by_pointer() {
        let map = SourceMap::build(TEMPLATE);
        assert_eq!(map.line_for(""), Some(1));
        assert_eq!(map.line_for("/name"), Some(3));
        assert_eq!(map.line_for("/commands/0"), Some(5));
        assert_eq!(map.line_for("/commands/0/command"), Some(5));
        assert_eq!(map.line_for("/commands/1"), Some(6));
        assert_eq!(map.line_for("/commands/1/script"), Some(7));
        assert_eq!(map.line_for("/commands/1/outputs/0"), Some(8));
        assert_eq!(map.line_for("/a~1b/x~0y"), Some(11));
    }

    #[test]
    fn test_unknown_pointer_falls_back_to_ancestor() {
        let map = SourceMap::build(TEMPLATE);
        assert_eq!(map.line_for("/commands/1/library"), Some(6));
        assert_eq!(map.line_for("/missing"), Some(1));
    }

    #[test]
    fn test_parse_error_has_line() {
        let err = JsonDocument::parse("broken.json", "{\n  \"name\": \"x\",\n  oops\n}").unwrap_err();
        assert_eq!(err.line, Some(3));
        assert!(err.message.starts_with("Invalid JSON"));
    }
}
