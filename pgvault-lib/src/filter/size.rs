//! Byte-count sink.

use serde_json::Value;

use super::{Filter, FilterIo};
use crate::error::Result;

#[derive(Debug, Default)]
pub struct SizeFilter {
    size: u64,
}

impl SizeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Filter for SizeFilter {
    fn name(&self) -> &'static str {
        "size"
    }

    fn process(&mut self, input: Option<&[u8]>, _output: &mut Vec<u8>) -> Result<FilterIo> {
        match input {
            Some(data) => {
                self.size += data.len() as u64;
                Ok(FilterIo::CONSUMED)
            }
            None => Ok(FilterIo::DONE),
        }
    }

    fn result(&mut self) -> Value {
        Value::from(self.size)
    }
}
