//! Typed parameter packs for dispatching file-level jobs to workers.
//!
//! A request is a command tag plus an ordered list of typed parameters; a
//! response is a parameter list or an error `(code, message)` pair. The
//! framing is one-call-one-reply and a worker processes one job at a
//! time. Locally the "wire" is a channel to a worker thread; a remote
//! transport would serialize the same values.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum ProtoValue {
    Bool(bool),
    I64(i64),
    U64(u64),
    Str(String),
    OptStr(Option<String>),
    StrList(Vec<String>),
    List(Vec<ProtoValue>),
}

impl ProtoValue {
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            ProtoValue::Bool(value) => Ok(*value),
            other => Err(type_error("bool", other)),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        match self {
            ProtoValue::I64(value) => Ok(*value),
            other => Err(type_error("i64", other)),
        }
    }

    pub fn as_u64(&self) -> Result<u64> {
        match self {
            ProtoValue::U64(value) => Ok(*value),
            other => Err(type_error("u64", other)),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            ProtoValue::Str(value) => Ok(value),
            other => Err(type_error("string", other)),
        }
    }

    pub fn as_opt_str(&self) -> Result<Option<&str>> {
        match self {
            ProtoValue::OptStr(value) => Ok(value.as_deref()),
            ProtoValue::Str(value) => Ok(Some(value)),
            other => Err(type_error("nullable string", other)),
        }
    }

    pub fn as_str_list(&self) -> Result<&[String]> {
        match self {
            ProtoValue::StrList(value) => Ok(value),
            other => Err(type_error("string list", other)),
        }
    }

    pub fn as_list(&self) -> Result<&[ProtoValue]> {
        match self {
            ProtoValue::List(value) => Ok(value),
            other => Err(type_error("list", other)),
        }
    }
}

fn type_error(expected: &str, got: &ProtoValue) -> Error {
    Error::Protocol(format!("expected {expected} parameter, got {got:?}"))
}

impl From<bool> for ProtoValue {
    fn from(value: bool) -> Self {
        ProtoValue::Bool(value)
    }
}

impl From<i64> for ProtoValue {
    fn from(value: i64) -> Self {
        ProtoValue::I64(value)
    }
}

impl From<u64> for ProtoValue {
    fn from(value: u64) -> Self {
        ProtoValue::U64(value)
    }
}

impl From<&str> for ProtoValue {
    fn from(value: &str) -> Self {
        ProtoValue::Str(value.to_owned())
    }
}

impl From<String> for ProtoValue {
    fn from(value: String) -> Self {
        ProtoValue::Str(value)
    }
}

impl From<Option<String>> for ProtoValue {
    fn from(value: Option<String>) -> Self {
        ProtoValue::OptStr(value)
    }
}

impl From<Vec<String>> for ProtoValue {
    fn from(value: Vec<String>) -> Self {
        ProtoValue::StrList(value)
    }
}

// ----------------------------------------------------------------------------

/// A request: command tag plus ordered parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtoCommand {
    pub name: &'static str,
    pub params: Vec<ProtoValue>,
}

impl ProtoCommand {
    pub fn new(name: &'static str, params: Vec<ProtoValue>) -> Self {
        Self { name, params }
    }

    pub fn param(&self, index: usize) -> Result<&ProtoValue> {
        self.params.get(index).ok_or_else(|| {
            Error::Protocol(format!(
                "command '{}' missing parameter {index}",
                self.name
            ))
        })
    }
}

/// One unit of work for the parallel dispatcher: a request plus the key
/// it is reported under (usually a file name).
#[derive(Debug, Clone)]
pub struct ProtoJob {
    pub key: String,
    pub command: ProtoCommand,
}

/// The one-call-one-reply response frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtoResponse {
    Ok(Vec<ProtoValue>),
    Error { code: i32, message: String },
}

impl ProtoResponse {
    pub fn from_result(result: Result<Vec<ProtoValue>>) -> Self {
        match result {
            Ok(values) => ProtoResponse::Ok(values),
            Err(err) => ProtoResponse::Error { code: err.code(), message: err.to_string() },
        }
    }

    pub fn into_result(self) -> Result<Vec<ProtoValue>> {
        match self {
            ProtoResponse::Ok(values) => Ok(values),
            ProtoResponse::Error { code, message } => Err(Error::from_code(code, message)),
        }
    }
}

/// Executes commands on behalf of a dispatcher; implemented by each
/// engine for its job types.
pub trait CommandHandler: Send + Sync {
    fn execute(&self, command: &ProtoCommand) -> Result<Vec<ProtoValue>>;
}

impl<F> CommandHandler for F
where
    F: Fn(&ProtoCommand) -> Result<Vec<ProtoValue>> + Send + Sync,
{
    fn execute(&self, command: &ProtoCommand) -> Result<Vec<ProtoValue>> {
        self(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_access_is_checked() {
        let command = ProtoCommand::new(
            "test",
            vec![
                ProtoValue::Bool(true),
                ProtoValue::Str("name".into()),
                ProtoValue::OptStr(None),
                ProtoValue::U64(42),
            ],
        );
        assert!(command.param(0).unwrap().as_bool().unwrap());
        assert_eq!(command.param(1).unwrap().as_str().unwrap(), "name");
        assert_eq!(command.param(2).unwrap().as_opt_str().unwrap(), None);
        assert_eq!(command.param(3).unwrap().as_u64().unwrap(), 42);
        assert!(command.param(0).unwrap().as_str().is_err());
        assert!(command.param(4).is_err());
    }

    #[test]
    fn errors_round_trip_the_frame() {
        let response =
            ProtoResponse::from_result(Err(Error::Checksum("digest mismatch".into())));
        let err = response.into_result().unwrap_err();
        assert_eq!(err.name(), "ChecksumError");
        assert_eq!(err.to_string(), "digest mismatch");
    }
}
