//! In-process keyspaces with per-key expiry, one per endpoint `database`.
//! Stands in for a cache server in tests and local development.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use switchyard_error::CallError;

use crate::descriptor::RedisCommand;

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires: Option<Instant>,
}

impl Slot {
    fn live(&self, now: Instant) -> bool {
        self.expires.is_none_or(|at| at > now)
    }
}

type Keyspace = HashMap<String, Slot>;

#[derive(Default)]
pub(super) struct Keyspaces {
    keyspaces: Mutex<HashMap<String, Keyspace>>,
}

fn arity(cmd: &RedisCommand, n: usize) -> Result<(), CallError> {
    if cmd.args.len() < n {
        return Err(CallError::invalid(
            "redis",
            format!("{} requires {n} argument(s)", cmd.name),
        ));
    }
    Ok(())
}

fn apply(space: &mut Keyspace, cmd: RedisCommand, now: Instant) -> Result<Value, CallError> {
    space.retain(|_, slot| slot.live(now));
    match cmd.name.as_str() {
        "GET" => {
            arity(&cmd, 1)?;
            Ok(space
                .get(&cmd.args[0])
                .map(|s| Value::String(s.value.clone()))
                .unwrap_or(Value::Null))
        }
        "SET" => {
            arity(&cmd, 2)?;
            let mut expires = None;
            let mut rest = cmd.args[2..].iter();
            while let Some(flag) = rest.next() {
                let unit = match flag.to_ascii_uppercase().as_str() {
                    "EX" => Duration::from_secs(1),
                    "PX" => Duration::from_millis(1),
                    other => {
                        return Err(CallError::invalid(
                            "redis",
                            format!("unsupported SET option '{other}'"),
                        ))
                    }
                };
                let amount: u32 = rest
                    .next()
                    .and_then(|n| n.parse().ok())
                    .ok_or_else(|| CallError::invalid("redis", "expiry must be a positive integer"))?;
                expires = Some(now + unit * amount);
            }
            space.insert(
                cmd.args[0].clone(),
                Slot {
                    value: cmd.args[1].clone(),
                    expires,
                },
            );
            Ok(Value::from("OK"))
        }
        "DEL" => {
            arity(&cmd, 1)?;
            let removed = cmd.args.iter().filter(|k| space.remove(*k).is_some()).count();
            Ok(Value::from(removed))
        }
        "EXISTS" => {
            arity(&cmd, 1)?;
            Ok(Value::from(
                cmd.args.iter().filter(|k| space.contains_key(*k)).count(),
            ))
        }
        "INCR" => {
            arity(&cmd, 1)?;
            let slot = space.entry(cmd.args[0].clone()).or_insert(Slot {
                value: "0".into(),
                expires: None,
            });
            let current: i64 = slot
                .value
                .parse()
                .map_err(|_| CallError::upstream("redis", "value is not an integer"))?;
            let next = current + 1;
            slot.value = next.to_string();
            Ok(Value::from(next))
        }
        "EXPIRE" => {
            arity(&cmd, 2)?;
            let secs: u64 = cmd.args[1]
                .parse()
                .map_err(|_| CallError::invalid("redis", "EXPIRE seconds must be an integer"))?;
            Ok(Value::from(match space.get_mut(&cmd.args[0]) {
                Some(slot) => {
                    slot.expires = Some(now + Duration::from_secs(secs));
                    1
                }
                None => 0,
            }))
        }
        "TTL" => {
            arity(&cmd, 1)?;
            Ok(Value::from(match space.get(&cmd.args[0]) {
                None => -2,
                Some(Slot { expires: None, .. }) => -1,
                Some(Slot {
                    expires: Some(at), ..
                }) => at.saturating_duration_since(now).as_millis().div_ceil(1000) as i64,
            }))
        }
        other => Err(CallError::invalid(
            "redis",
            format!("unsupported command '{other}'"),
        )),
    }
}

impl Keyspaces {
    pub(super) fn execute(&self, cmd: RedisCommand, connection: &Value) -> Result<Value, CallError> {
        let database = match connection.get("database") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => "0".to_string(),
        };
        let mut spaces = self.keyspaces.lock().unwrap_or_else(|e| e.into_inner());
        let space = spaces.entry(database).or_default();
        apply(space, cmd, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::RedisDriver;
    use crate::{BackendRequest, Driver};
    use serde_json::json;
    use switchyard_model::BackendKind;

    async fn run(driver: &RedisDriver, stmt: &str) -> Result<Value, CallError> {
        let req = BackendRequest::parse(BackendKind::Redis, &json!({ "executeStatement": stmt }))?;
        driver.execute(req, &json!({})).await.map(|v| v["data"].clone())
    }

    #[tokio::test]
    async fn set_get_incr_del() {
        let r = RedisDriver::in_memory();
        assert_eq!(run(&r, "SET greeting 'hello world'").await.unwrap(), "OK");
        assert_eq!(run(&r, "get greeting").await.unwrap(), "hello world");
        assert_eq!(run(&r, "INCR hits").await.unwrap(), 1);
        assert_eq!(run(&r, "INCR hits").await.unwrap(), 2);
        assert_eq!(run(&r, "EXISTS hits greeting nope").await.unwrap(), 2);
        assert_eq!(run(&r, "DEL hits nope").await.unwrap(), 1);
        assert_eq!(run(&r, "GET hits").await.unwrap(), Value::Null);
        let err = run(&r, "INCR greeting").await.unwrap_err();
        assert_eq!(err.code(), "UPSTREAM_ERROR");
    }

    #[test]
    fn expiry_and_ttl() {
        let mut space = Keyspace::new();
        let t0 = Instant::now();
        let cmd = |s: &str| {
            let mut parts: Vec<String> = s.split(' ').map(String::from).collect();
            RedisCommand {
                name: parts.remove(0),
                args: parts,
            }
        };
        apply(&mut space, cmd("SET k v EX 10"), t0).unwrap();
        apply(&mut space, cmd("SET p v"), t0).unwrap();
        assert_eq!(apply(&mut space, cmd("TTL p"), t0).unwrap(), -1);
        assert_eq!(apply(&mut space, cmd("TTL nope"), t0).unwrap(), -2);
        let ttl = apply(&mut space, cmd("TTL k"), t0 + Duration::from_secs(4)).unwrap();
        assert_eq!(ttl, 6);
        let later = t0 + Duration::from_secs(11);
        assert_eq!(apply(&mut space, cmd("GET k"), later).unwrap(), Value::Null);
        assert_eq!(apply(&mut space, cmd("EXPIRE p 1"), later).unwrap(), 1);
    }

    #[tokio::test]
    async fn arity_is_checked() {
        let r = RedisDriver::in_memory();
        assert_eq!(run(&r, "SET onlykey").await.unwrap_err().code(), "INVALID_REQUEST");
        assert_eq!(run(&r, "FLUSHALL").await.unwrap_err().code(), "INVALID_REQUEST");
    }
}
