use std::fmt;

/// Closed set of result codes shared by every fallible operation in the suite.
///
/// The numeric values are part of the control protocol (`poll` replies carry
/// them as decimal strings), so they are pinned explicitly and must not be
/// reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum StatusCode {
    #[default]
    Ok = 0,
    FileError = 1,
    InvalidParameter = 2,
    IncompatibleParameter = 3,
    ConfigurationError = 4,
    RegisterIoError = 5,
    NotImplemented = 6,
    MemberAbsent = 7,
    /// Doubles as the generic cannot-open code for loggers and subprocesses.
    LoggerCannotOpen = 8,
    ResourceBusy = 9,
    NotFound = 10,
    LoggerCannotInsert = 11,
    NotReady = 12,
    AccessDenied = 13,
    /// Worker state codes, reported through `poll`.
    Running = 14,
    Stopped = 15,
}

impl StatusCode {
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            1 => Some(Self::FileError),
            2 => Some(Self::InvalidParameter),
            3 => Some(Self::IncompatibleParameter),
            4 => Some(Self::ConfigurationError),
            5 => Some(Self::RegisterIoError),
            6 => Some(Self::NotImplemented),
            7 => Some(Self::MemberAbsent),
            8 => Some(Self::LoggerCannotOpen),
            9 => Some(Self::ResourceBusy),
            10 => Some(Self::NotFound),
            11 => Some(Self::LoggerCannotInsert),
            12 => Some(Self::NotReady),
            13 => Some(Self::AccessDenied),
            14 => Some(Self::Running),
            15 => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// Uniform result value: a code from the closed kind set plus a human-readable
/// message. [Status::ok] is the zero value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Status {
    pub code: StatusCode,
    pub msg: String,
}

impl Status {
    pub fn new<S: Into<String>>(code: StatusCode, msg: S) -> Self {
        Status {
            code,
            msg: msg.into(),
        }
    }

    pub fn ok() -> Self {
        Status::default()
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{:?}", self.code)
        } else {
            write!(f, "{}", self.msg)
        }
    }
}

impl std::error::Error for Status {}

/// Result alias used across the observer layer.
pub type EfiResult<T> = Result<T, Status>;
