use serde::{Deserialize, Serialize};

use crate::error::{PackerError, PackerResult};

/// A logical record stored by the packer.
///
/// The payload is opaque; the packer never parses it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub payload: Vec<u8>,
}

impl Item {
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }

    pub(crate) fn validate(&self) -> PackerResult<()> {
        validate_id(&self.id)
    }
}

pub(crate) fn validate_id(id: &str) -> PackerResult<()> {
    if id.is_empty() {
        return Err(PackerError::InvalidArgument("missing ID".into()));
    }
    Ok(())
}
