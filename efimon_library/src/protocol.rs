use crate::status::Status;
use serde::{Deserialize, Serialize};

/// Control requests accepted by the daemon, tagged by the `transaction`
/// field. Unknown or malformed payloads fail deserialisation and are
/// answered with INVALID_PARAMETER.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "transaction", rename_all = "lowercase")]
pub enum Request {
    /// Start or stop the system collector.
    System {
        state: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay: Option<u64>,
    },
    /// Start or stop a per-PID worker.
    Process {
        state: bool,
        pid: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        samples: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        perf: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        frequency: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Report the state of a worker.
    Poll { pid: u32 },
}

/// Reply for every request: `result` is empty on success (or the Status code
/// as decimal for `poll`), `code` is the numeric Status kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Reply {
    pub result: String,
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Reply {
    pub fn from_status(status: &Status) -> Self {
        Reply {
            result: status.msg.clone(),
            code: status.code as i32,
            name: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;
    use rstest::rstest;

    #[rstest]
    fn parses_a_system_request() {
        let req: Request = serde_json::from_str(r#"{"transaction":"system","state":true}"#).unwrap();
        assert_eq!(req, Request::System { state: true, delay: None });
    }

    #[rstest]
    fn parses_a_process_request_with_optionals() {
        let req: Request = serde_json::from_str(
            r#"{"transaction":"process","state":true,"pid":42,"delay":1,"samples":3,"perf":false}"#,
        )
        .unwrap();
        match req {
            Request::Process {
                state,
                pid,
                delay,
                samples,
                perf,
                frequency,
                name,
            } => {
                assert!(state);
                assert_eq!(pid, 42);
                assert_eq!(delay, Some(1));
                assert_eq!(samples, Some(3));
                assert_eq!(perf, Some(false));
                assert_eq!(frequency, None);
                assert_eq!(name, None);
            },
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[rstest]
    fn parses_a_poll_request() {
        let req: Request = serde_json::from_str(r#"{"transaction":"poll","pid":7}"#).unwrap();
        assert_eq!(req, Request::Poll { pid: 7 });
    }

    #[rstest]
    #[case(r#"{"transaction":"bogus"}"#)]
    #[case(r#"{"state":true}"#)]
    #[case(r#"{"transaction":"process","state":true}"#)]
    #[case("not json at all")]
    fn malformed_requests_fail(#[case] payload: &str) {
        assert!(serde_json::from_str::<Request>(payload).is_err());
    }

    #[rstest]
    fn replies_serialise_without_empty_name() {
        let reply = Reply::from_status(&Status::new(StatusCode::ResourceBusy, "busy"));
        let json = serde_json::to_string(&reply).unwrap();
        assert_eq!(json, r#"{"result":"busy","code":9}"#);
    }

    #[rstest]
    fn replies_carry_an_assigned_name() {
        let mut reply = Reply::from_status(&Status::ok());
        reply.name = Some("/tmp/efimon-42-1.csv".to_string());
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains("efimon-42-1.csv"));
        let back: Reply = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reply);
    }
}
