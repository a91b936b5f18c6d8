use bytes::Buf;

use crate::error::{ReaderError, Result};

/// SQLSTATE `undefined_object`: `START_REPLICATION` on a slot that does not exist.
pub const SQLSTATE_UNDEFINED_OBJECT: &str = "42704";
/// SQLSTATE `object_in_use`: the slot is already streaming to another walsender.
pub const SQLSTATE_OBJECT_IN_USE: &str = "55006";
/// SQLSTATE `duplicate_object`: `CREATE_REPLICATION_SLOT` on an existing name.
pub const SQLSTATE_DUPLICATE_OBJECT: &str = "42710";

/// Fields of an ErrorResponse or NoticeResponse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    pub severity: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl ErrorFields {
    /// Parse `(code_byte, cstring)* \0`. Unknown field codes are skipped.
    pub fn parse(payload: &[u8]) -> ErrorFields {
        let mut fields = ErrorFields::default();
        let mut b = payload;

        while let Some((&code, rest)) = b.split_first() {
            if code == 0 {
                break;
            }
            let Some(pos) = rest.iter().position(|&x| x == 0) else {
                break;
            };
            let value = String::from_utf8_lossy(&rest[..pos]).into_owned();
            match code {
                // 'V' is the non-localized severity; prefer it over 'S'
                b'V' => fields.severity = Some(value),
                b'S' if fields.severity.is_none() => fields.severity = Some(value),
                b'C' => fields.code = Some(value),
                b'M' => fields.message = Some(value),
                b'D' => fields.detail = Some(value),
                b'H' => fields.hint = Some(value),
                _ => {}
            }
            b = &rest[pos + 1..];
        }
        fields
    }

    pub fn has_code(&self, sqlstate: &str) -> bool {
        self.code.as_deref() == Some(sqlstate)
    }

    /// Slot errors need operator action rather than a reconnect.
    pub fn is_slot_error(&self) -> bool {
        self.has_code(SQLSTATE_UNDEFINED_OBJECT) || self.has_code(SQLSTATE_OBJECT_IN_USE)
    }

    /// Class 08 (connection exception) and 57P (server shutting down or
    /// terminating backends) go away on reconnect.
    pub fn is_transient(&self) -> bool {
        self.code
            .as_deref()
            .is_some_and(|c| c.starts_with("08") || c.starts_with("57P"))
    }

    pub fn into_error(self) -> ReaderError {
        if self.is_slot_error() {
            ReaderError::Slot(self.to_string())
        } else if self.is_transient() {
            ReaderError::Connection(self.to_string())
        } else {
            ReaderError::Server(self.to_string())
        }
    }
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message.as_deref().unwrap_or("unknown server error"))?;
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {code})")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

pub fn parse_error_response(payload: &[u8]) -> String {
    ErrorFields::parse(payload).to_string()
}

pub fn parse_auth_request(payload: &[u8]) -> Result<(i32, &[u8])> {
    if payload.len() < 4 {
        return Err(ReaderError::MalformedFrame("auth request too short".into()));
    }
    let mut b = payload;
    let code = b.get_i32();
    Ok((code, b))
}

/// ParameterStatus: `name\0value\0`.
pub fn parse_parameter_status(payload: &[u8]) -> Result<(String, String)> {
    let mut parts = payload.split(|&b| b == 0);
    match (parts.next(), parts.next()) {
        (Some(k), Some(v)) => Ok((
            String::from_utf8_lossy(k).into_owned(),
            String::from_utf8_lossy(v).into_owned(),
        )),
        _ => Err(ReaderError::MalformedFrame(
            "ParameterStatus missing terminator".into(),
        )),
    }
}

/// Column names out of a RowDescription.
pub fn parse_row_description(payload: &[u8]) -> Result<Vec<String>> {
    let short = || ReaderError::MalformedFrame("RowDescription truncated".into());
    let mut b = payload;
    if b.remaining() < 2 {
        return Err(short());
    }
    let n = b.get_i16().max(0) as usize;
    let mut names = Vec::with_capacity(n);
    for _ in 0..n {
        let pos = b.iter().position(|&x| x == 0).ok_or_else(short)?;
        names.push(String::from_utf8_lossy(&b[..pos]).into_owned());
        b = &b[pos + 1..];
        // table oid(4) attnum(2) type oid(4) typlen(2) typmod(4) format(2)
        if b.remaining() < 18 {
            return Err(short());
        }
        b.advance(18);
    }
    Ok(names)
}

/// Text-format DataRow; SQL NULL becomes `None`.
pub fn parse_data_row(payload: &[u8]) -> Result<Vec<Option<String>>> {
    let short = || ReaderError::MalformedFrame("DataRow truncated".into());
    let mut b = payload;
    if b.remaining() < 2 {
        return Err(short());
    }
    let n = b.get_i16().max(0) as usize;
    let mut row = Vec::with_capacity(n);
    for _ in 0..n {
        if b.remaining() < 4 {
            return Err(short());
        }
        let len = b.get_i32();
        if len < 0 {
            row.push(None);
            continue;
        }
        let len = len as usize;
        if b.remaining() < len {
            return Err(short());
        }
        row.push(Some(String::from_utf8_lossy(&b[..len]).into_owned()));
        b.advance(len);
    }
    Ok(row)
}

/// Rows of a simple query, text format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub command_tag: Option<String>,
}

impl QueryResult {
    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Value of `name` in the first row.
    pub fn first(&self, name: &str) -> Option<&str> {
        let idx = self.column(name)?;
        self.rows.first()?.get(idx)?.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_payload() -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(b"SERROR\0VERROR\0C42704\0");
        p.extend_from_slice(b"Mreplication slot \"s\" does not exist\0");
        p.push(0);
        p
    }

    #[test]
    fn parse_error_prefers_message() {
        // 'M' "hello" \0 'C' "12345" \0 \0
        let payload = [
            b'M', b'h', b'e', b'l', b'l', b'o', 0, b'C', b'1', b'2', b'3', b'4', b'5', 0, 0,
        ];
        let s = parse_error_response(&payload);
        assert!(s.contains("hello"));
        assert!(s.contains("SQLSTATE 12345"));
    }

    #[test]
    fn missing_slot_maps_to_slot_error() {
        let fields = ErrorFields::parse(&error_payload());
        assert_eq!(fields.severity.as_deref(), Some("ERROR"));
        assert!(fields.is_slot_error());
        let err = fields.into_error();
        assert!(err.is_slot());
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn other_codes_map_to_server_error() {
        let fields = ErrorFields::parse(b"C28P01\0Mpassword authentication failed\0\0");
        assert!(matches!(fields.into_error(), ReaderError::Server(_)));
    }

    #[test]
    fn admin_shutdown_is_transient() {
        let fields = ErrorFields::parse(
            b"SFATAL\0C57P01\0Mterminating connection due to administrator command\0\0",
        );
        assert!(fields.into_error().is_transient());
    }

    #[test]
    fn parameter_status_pair() {
        let (k, v) = parse_parameter_status(b"integer_datetimes\0on\0").unwrap();
        assert_eq!(k, "integer_datetimes");
        assert_eq!(v, "on");
    }

    #[test]
    fn data_row_with_null() {
        let mut p = Vec::new();
        p.extend_from_slice(&2i16.to_be_bytes());
        p.extend_from_slice(&2i32.to_be_bytes());
        p.extend_from_slice(b"ab");
        p.extend_from_slice(&(-1i32).to_be_bytes());
        let row = parse_data_row(&p).unwrap();
        assert_eq!(row, vec![Some("ab".to_string()), None]);
    }

    #[test]
    fn data_row_truncated() {
        let mut p = Vec::new();
        p.extend_from_slice(&1i16.to_be_bytes());
        p.extend_from_slice(&10i32.to_be_bytes());
        p.extend_from_slice(b"ab");
        assert!(parse_data_row(&p).unwrap_err().is_malformed());
    }

    #[test]
    fn row_description_names() {
        let mut p = Vec::new();
        p.extend_from_slice(&2i16.to_be_bytes());
        for name in ["slot_name", "plugin"] {
            p.extend_from_slice(name.as_bytes());
            p.push(0);
            p.extend_from_slice(&[0u8; 18]);
        }
        assert_eq!(parse_row_description(&p).unwrap(), vec!["slot_name", "plugin"]);
    }
}
