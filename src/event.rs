use std::fmt;

use thiserror::Error;

/// Atom ids the processor treats specially. All other ids are opaque and
/// flow straight through to the metrics managers.
pub mod atom {
    /// (parentUid, isolatedUid, isCreate) — mutates the uid map.
    pub const ISOLATED_UID_CHANGED: i32 = 43;
    /// Declared by anomaly trackers; included in the default filter set.
    pub const ANOMALY_DETECTED: i32 = 46;
    /// (uid, label, state) — validated against the logger uid.
    pub const APP_BREADCRUMB_REPORTED: i32 = 47;
    /// Install-train state transition; rewritten from on-disk train info.
    pub const BINARY_PUSH_STATE_CHANGED: i32 = 102;
    /// (rollbackType, packageName) — updates on-disk experiment ids.
    pub const WATCHDOG_ROLLBACK_OCCURRED: i32 = 104;
    /// Reported by the ingress when socket data was lost.
    pub const STATS_SOCKET_LOSS_REPORTED: i32 = 752;
}

/// Uid of the daemon itself. The daemon may log breadcrumbs on behalf of
/// other uids, so breadcrumb validation exempts it.
pub const DAEMON_UID: i32 = 1066;

/// Install states carried by the binary-push atom.
pub mod push_state {
    pub const INSTALL_SUCCESS: i32 = 3;
    pub const INSTALLER_ROLLBACK_INITIATED: i32 = 4;
    pub const INSTALLER_ROLLBACK_SUCCESS: i32 = 6;
}

/// Rollback types carried by the watchdog-rollback atom.
pub mod rollback_type {
    pub const INITIATE: i32 = 1;
    pub const SUCCESS: i32 = 3;
}

/// One decoded field of an atom.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
}

/// Errors from positional field access.
#[derive(Debug, Error, PartialEq)]
pub enum FieldError {
    #[error("field {0} out of range")]
    OutOfRange(usize),
    #[error("field {0} has unexpected type")]
    WrongType(usize),
}

/// A decoded log event: a tag id plus a tuple of typed fields.
///
/// The ingress decoder (out of scope here) produces these; the processor
/// may rewrite individual fields before fan-out. Field positions are
/// 1-indexed, matching how atoms number their fields.
#[derive(Debug, Clone)]
pub struct LogEvent {
    atom_id: i32,
    elapsed_ns: i64,
    logger_uid: i32,
    logger_pid: i32,
    values: Vec<Value>,
    /// 1-indexed positions of fields that carry uids and must be remapped
    /// from isolated to host before aggregation.
    uid_field_positions: Vec<usize>,
    /// 1-indexed inclusive range of an attribution chain, if present. Uid
    /// remapping walks this range instead of `uid_field_positions`.
    attribution_range: Option<(usize, usize)>,
    header_only: bool,
    valid: bool,
    restricted: bool,
}

impl LogEvent {
    pub fn new(atom_id: i32, elapsed_ns: i64) -> Self {
        Self {
            atom_id,
            elapsed_ns,
            logger_uid: 0,
            logger_pid: 0,
            values: Vec::new(),
            uid_field_positions: Vec::new(),
            attribution_range: None,
            header_only: false,
            valid: true,
            restricted: false,
        }
    }

    pub fn with_logger(mut self, uid: i32, pid: i32) -> Self {
        self.logger_uid = uid;
        self.logger_pid = pid;
        self
    }

    pub fn with_values(mut self, values: Vec<Value>) -> Self {
        self.values = values;
        self
    }

    pub fn with_uid_fields(mut self, positions: Vec<usize>) -> Self {
        self.uid_field_positions = positions;
        self
    }

    pub fn with_attribution_range(mut self, first: usize, last: usize) -> Self {
        self.attribution_range = Some((first, last));
        self
    }

    pub fn with_restricted(mut self, restricted: bool) -> Self {
        self.restricted = restricted;
        self
    }

    pub fn mark_invalid(mut self) -> Self {
        self.valid = false;
        self
    }

    pub fn mark_header_only(mut self) -> Self {
        self.header_only = true;
        self
    }

    pub fn atom_id(&self) -> i32 {
        self.atom_id
    }

    pub fn elapsed_ns(&self) -> i64 {
        self.elapsed_ns
    }

    pub fn logger_uid(&self) -> i32 {
        self.logger_uid
    }

    pub fn logger_pid(&self) -> i32 {
        self.logger_pid
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_header_only(&self) -> bool {
        self.header_only
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted
    }

    /// Number of decoded fields.
    pub fn size(&self) -> usize {
        self.values.len()
    }

    pub fn attribution_range(&self) -> Option<(usize, usize)> {
        self.attribution_range
    }

    pub fn uid_field_positions(&self) -> &[usize] {
        &self.uid_field_positions
    }

    fn value(&self, pos: usize) -> Result<&Value, FieldError> {
        if pos == 0 || pos > self.values.len() {
            return Err(FieldError::OutOfRange(pos));
        }
        Ok(&self.values[pos - 1])
    }

    /// Reads an integer-typed field, widening Int to Long.
    pub fn long(&self, pos: usize) -> Result<i64, FieldError> {
        match self.value(pos)? {
            Value::Long(v) => Ok(*v),
            Value::Int(v) => Ok(i64::from(*v)),
            _ => Err(FieldError::WrongType(pos)),
        }
    }

    pub fn int(&self, pos: usize) -> Result<i32, FieldError> {
        match self.value(pos)? {
            Value::Int(v) => Ok(*v),
            Value::Long(v) => Ok(*v as i32),
            _ => Err(FieldError::WrongType(pos)),
        }
    }

    pub fn bool(&self, pos: usize) -> Result<bool, FieldError> {
        match self.value(pos)? {
            Value::Bool(v) => Ok(*v),
            Value::Int(v) => Ok(*v != 0),
            _ => Err(FieldError::WrongType(pos)),
        }
    }

    pub fn string(&self, pos: usize) -> Result<&str, FieldError> {
        match self.value(pos)? {
            Value::Str(v) => Ok(v),
            _ => Err(FieldError::WrongType(pos)),
        }
    }

    pub fn bytes(&self, pos: usize) -> Result<&[u8], FieldError> {
        match self.value(pos)? {
            Value::Bytes(v) => Ok(v),
            _ => Err(FieldError::WrongType(pos)),
        }
    }

    /// Overwrites a field in place. Out-of-range positions are ignored so a
    /// short event cannot make a rewrite panic.
    pub fn set_value(&mut self, pos: usize, value: Value) {
        if pos >= 1 && pos <= self.values.len() {
            self.values[pos - 1] = value;
        }
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "atom={} elapsed={} fields={}",
            self.atom_id,
            self.elapsed_ns,
            self.values.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_access_is_one_indexed() {
        let event = LogEvent::new(47, 100).with_values(vec![
            Value::Long(1000),
            Value::Long(7),
            Value::Long(2),
        ]);

        assert_eq!(event.size(), 3);
        assert_eq!(event.long(1), Ok(1000));
        assert_eq!(event.long(3), Ok(2));
        assert_eq!(event.long(0), Err(FieldError::OutOfRange(0)));
        assert_eq!(event.long(4), Err(FieldError::OutOfRange(4)));
    }

    #[test]
    fn test_int_widens_to_long() {
        let event = LogEvent::new(1, 0).with_values(vec![Value::Int(42)]);
        assert_eq!(event.long(1), Ok(42));
    }

    #[test]
    fn test_wrong_type() {
        let event = LogEvent::new(1, 0).with_values(vec![Value::Str("x".into())]);
        assert_eq!(event.long(1), Err(FieldError::WrongType(1)));
        assert_eq!(event.string(1), Ok("x"));
    }

    #[test]
    fn test_set_value_out_of_range_is_ignored() {
        let mut event = LogEvent::new(1, 0).with_values(vec![Value::Int(1)]);
        event.set_value(5, Value::Int(9));
        event.set_value(0, Value::Int(9));
        assert_eq!(event.int(1), Ok(1));
    }

    #[test]
    fn test_set_value_rewrites() {
        let mut event = LogEvent::new(1, 0).with_values(vec![Value::Long(5), Value::Bool(false)]);
        event.set_value(1, Value::Long(6));
        event.set_value(2, Value::Int(1));
        assert_eq!(event.long(1), Ok(6));
        assert_eq!(event.bool(2), Ok(true));
    }
}
