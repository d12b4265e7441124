//! JSON output for CLI commands
//!
//! Every command prints exactly one envelope line on stdout:
//! `{"status":"ok","data":...}` or `{"status":"error","code":..,"message":..}`.

use std::io::{self, Write};

use serde::Serialize;
use serde_json::Value;

use super::errors::CliResult;

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum Envelope<'a> {
    Ok { data: Value },
    Error { code: &'a str, message: &'a str },
}

fn emit<W: Write>(out: &mut W, envelope: &Envelope<'_>) -> CliResult<()> {
    serde_json::to_writer(&mut *out, envelope)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

pub fn write_response(data: Value) -> CliResult<()> {
    emit(&mut io::stdout().lock(), &Envelope::Ok { data })
}

pub fn write_error(code: &str, message: &str) -> CliResult<()> {
    emit(&mut io::stdout().lock(), &Envelope::Error { code, message })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(envelope: Envelope<'_>) -> Value {
        let mut out = Vec::new();
        emit(&mut out, &envelope).unwrap();
        assert_eq!(out.last(), Some(&b'\n'));
        serde_json::from_slice(&out).unwrap()
    }

    #[test]
    fn test_ok_envelope() {
        let v = render(Envelope::Ok {
            data: serde_json::json!({ "epochs_replayed": 2 }),
        });
        assert_eq!(v["status"], "ok");
        assert_eq!(v["data"]["epochs_replayed"], 2);
    }

    #[test]
    fn test_error_envelope() {
        let v = render(Envelope::Error {
            code: "SAMWAL_CLI_IO_ERROR",
            message: "log device missing",
        });
        assert_eq!(v["status"], "error");
        assert_eq!(v["code"], "SAMWAL_CLI_IO_ERROR");
        assert_eq!(v["message"], "log device missing");
    }
}
