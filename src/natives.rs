use super::value::{NativeFn, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Built-ins installed as globals when a VM starts up.
pub const NATIVES: [(&str, NativeFn); 1] = [("clock", clock)];

fn clock(_args: &[Value]) -> Value {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Value::Number(elapsed.as_secs_f64())
}
