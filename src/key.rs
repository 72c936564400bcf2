//! Item key grammar
//!
//! A key is a dotted identifier optionally followed by a bracketed,
//! comma-separated parameter list:
//!
//! ```text
//! vfs.file.contents[/etc/passwd,utf8]
//! net.tcp.service["http", , 8080]
//! custom.query[[a,b],x]
//! ```
//!
//! Parameters may be quoted (`\"` escapes a quote), unquoted (leading spaces
//! are skipped, trailing spaces are significant) or an array in brackets.
//! Access rule patterns use the same grammar with `*` additionally allowed in
//! the key name.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("empty key")]
    EmptyKey,

    #[error("invalid character {ch:?} at position {position}")]
    InvalidCharacter { ch: char, position: usize },

    #[error("unterminated parameter list")]
    UnterminatedBracket,

    #[error("unterminated quoted parameter starting at position {position}")]
    UnterminatedQuote { position: usize },

    #[error("unexpected data after parameter list at position {position}")]
    TrailingData { position: usize },
}

/// A parsed item key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemKey {
    /// Key name without parameters
    pub name: String,

    /// Parameters in declaration order (quotes removed)
    pub params: Vec<String>,

    /// Whether the key was written with a parameter list at all
    pub bracketed: bool,
}

/// Characters allowed in a key name
pub fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

impl ItemKey {
    /// Parse an item key as sent by the server or a passive peer
    pub fn parse(text: &str) -> Result<Self, KeyError> {
        parse_key(text, false)
    }

    /// Parse an access rule pattern (`*` allowed in the key name)
    pub fn parse_pattern(text: &str) -> Result<Self, KeyError> {
        parse_key(text, true)
    }

    /// `key[]`: exactly one parameter and it is empty
    pub fn has_empty_arguments(&self) -> bool {
        self.params.len() == 1 && self.params[0].is_empty()
    }
}

fn parse_key(text: &str, wildcard: bool) -> Result<ItemKey, KeyError> {
    let name_end = text
        .char_indices()
        .find(|(_, c)| !(is_key_char(*c) || (wildcard && *c == '*')))
        .map_or(text.len(), |(position, _)| position);

    if name_end == 0 {
        return match text.chars().next() {
            None | Some('[') => Err(KeyError::EmptyKey),
            Some(ch) => Err(KeyError::InvalidCharacter { ch, position: 0 }),
        };
    }

    let name = text[..name_end].to_string();
    let rest = &text[name_end..];

    let Some(ch) = rest.chars().next() else {
        return Ok(ItemKey {
            name,
            params: Vec::new(),
            bracketed: false,
        });
    };

    if ch != '[' {
        return Err(KeyError::InvalidCharacter {
            ch,
            position: name_end,
        });
    }

    let (params, end) = parse_params(text, name_end + 1)?;
    if end != text.len() {
        return Err(KeyError::TrailingData { position: end });
    }

    Ok(ItemKey {
        name,
        params,
        bracketed: true,
    })
}

/// Parse parameters starting right after the opening bracket. Returns the
/// parameters and the byte offset following the closing bracket.
fn parse_params(text: &str, start: usize) -> Result<(Vec<String>, usize), KeyError> {
    let bytes = text.as_bytes();
    let len = bytes.len();
    let mut params = Vec::new();
    let mut i = start;

    loop {
        while i < len && bytes[i] == b' ' {
            i += 1;
        }
        if i >= len {
            return Err(KeyError::UnterminatedBracket);
        }

        match bytes[i] {
            b'"' => {
                let quote_start = i;
                i += 1;
                let mut value = String::new();
                let mut segment = i;
                loop {
                    if i >= len {
                        return Err(KeyError::UnterminatedQuote {
                            position: quote_start,
                        });
                    }
                    match bytes[i] {
                        b'\\' if i + 1 < len && bytes[i + 1] == b'"' => {
                            value.push_str(&text[segment..i]);
                            value.push('"');
                            i += 2;
                            segment = i;
                        }
                        b'"' => {
                            value.push_str(&text[segment..i]);
                            i += 1;
                            break;
                        }
                        _ => i += 1,
                    }
                }
                while i < len && bytes[i] == b' ' {
                    i += 1;
                }
                params.push(value);
            }
            b'[' => {
                i += 1;
                let content = i;
                while i < len && bytes[i] != b']' {
                    i += 1;
                }
                if i >= len {
                    return Err(KeyError::UnterminatedBracket);
                }
                params.push(text[content..i].to_string());
                i += 1;
                while i < len && bytes[i] == b' ' {
                    i += 1;
                }
            }
            _ => {
                let value_start = i;
                while i < len && bytes[i] != b',' && bytes[i] != b']' {
                    i += 1;
                }
                params.push(text[value_start..i].to_string());
            }
        }

        if i >= len {
            return Err(KeyError::UnterminatedBracket);
        }

        match bytes[i] {
            b',' => i += 1,
            b']' => return Ok((params, i + 1)),
            _ => {
                let ch = text[i..].chars().next().unwrap_or('?');
                return Err(KeyError::InvalidCharacter { ch, position: i });
            }
        }
    }
}
