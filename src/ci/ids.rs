//! Parsing of opaque GraphQL node ids.
//!
//! The upstream API hands out ids like `QnVpbGQtLS0wMTkw...`, which are base64
//! of `<Type>---<uuid>`. REST endpoints and the `uuid:` lookups want the raw
//! uuid, so it has to be dug out of the opaque form.

use base64::Engine;
use thiserror::Error;

const SEPARATOR: &str = "---";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
  #[error("id is empty")]
  Empty,
  #[error("id is not valid base64: {0}")]
  NotBase64(String),
  #[error("decoded id is not valid UTF-8")]
  NotUtf8,
  #[error("expected a {expected} id, found a {found} id")]
  WrongType { expected: String, found: String },
  #[error("malformed id: {0}")]
  Malformed(String),
}

/// Splits an opaque id into its `(type, uuid)` parts.
pub fn decode_node_id(opaque: &str) -> Result<(String, String), IdError> {
  let trimmed = opaque.trim();
  if trimmed.is_empty() {
    return Err(IdError::Empty);
  }

  let bytes = base64::engine::general_purpose::STANDARD
    .decode(trimmed)
    .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(trimmed))
    .map_err(|e| IdError::NotBase64(e.to_string()))?;
  let decoded = String::from_utf8(bytes).map_err(|_| IdError::NotUtf8)?;

  let (kind, raw) = decoded
    .split_once(SEPARATOR)
    .ok_or_else(|| IdError::Malformed(decoded.clone()))?;
  if kind.is_empty() || !is_uuid(raw) {
    return Err(IdError::Malformed(decoded.clone()));
  }

  Ok((kind.to_string(), raw.to_ascii_lowercase()))
}

/// Encodes a `(type, uuid)` pair into the opaque form.
pub fn encode_node_id(kind: &str, uuid: &str) -> String {
  base64::engine::general_purpose::STANDARD.encode(format!("{kind}{SEPARATOR}{uuid}"))
}

/// Extracts the build uuid from an opaque build id. A bare uuid is accepted
/// as-is.
pub fn parse_build_id(id: &str) -> Result<String, IdError> {
  parse_typed_id("Build", id)
}

/// Extracts the job uuid from an opaque job id (`JobTypeCommand---<uuid>` and
/// friends). A bare uuid is accepted as-is.
pub fn parse_job_id(id: &str) -> Result<String, IdError> {
  let trimmed = id.trim();
  if is_uuid(trimmed) {
    return Ok(trimmed.to_ascii_lowercase());
  }
  let (kind, uuid) = decode_node_id(trimmed)?;
  if kind.starts_with("Job") {
    Ok(uuid)
  } else {
    Err(IdError::WrongType {
      expected: "Job".into(),
      found: kind,
    })
  }
}

fn parse_typed_id(expected: &str, id: &str) -> Result<String, IdError> {
  let trimmed = id.trim();
  if is_uuid(trimmed) {
    return Ok(trimmed.to_ascii_lowercase());
  }
  let (kind, uuid) = decode_node_id(trimmed)?;
  if kind == expected {
    Ok(uuid)
  } else {
    Err(IdError::WrongType {
      expected: expected.into(),
      found: kind,
    })
  }
}

/// 8-4-4-4-12 hex groups.
fn is_uuid(s: &str) -> bool {
  let groups: Vec<&str> = s.split('-').collect();
  groups.len() == 5
    && groups
      .iter()
      .zip([8, 4, 4, 4, 12])
      .all(|(g, len)| g.len() == len && g.chars().all(|c| c.is_ascii_hexdigit()))
}
