//! Compiled-in native function table for interpreter built-ins (spec §4.7
//! step 6). `os` and `builtins` ship with every peer binary exactly the
//! way `os` ships with every CPython install — calling them never goes
//! through `GET_MODULE` and never touches [`super::library`]/
//! [`super::loader`]. User-authored program code is a different tier
//! entirely: see [`super::library`] for that.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::value::{CallError, Value};

/// Outcome of a native call: either a value to reply with, or the pieces
/// of a `CallError` (spec §6 `CALL_FUNCTION` reply).
pub type CallResult = Result<Value, CallError>;

/// A function reachable through `CALL_FUNCTION` (spec §4.7 step 6).
pub type NativeFn = fn(Vec<Value>, Vec<(Value, Value)>) -> CallResult;

/// `(module_name, class_name, func_name)`, exactly the addressing triple
/// carried by a `CALL_FUNCTION` request (spec §6).
pub type CallKey = (&'static str, Option<&'static str>, &'static str);

fn registry() -> &'static HashMap<CallKey, NativeFn> {
    static REGISTRY: OnceLock<HashMap<CallKey, NativeFn>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        HashMap::from([
            (("os", None, "getuid"), os_getuid as NativeFn),
            (("os", None, "getpid"), os_getpid as NativeFn),
            (("os", None, "getcwd"), os_getcwd as NativeFn),
            (("builtins", None, "echo"), builtins_echo as NativeFn),
        ])
    })
}

/// Resolve a `CALL_FUNCTION` addressing triple to the native function that
/// implements it, if `module` is a built-in rather than a served module.
pub fn lookup_function(module: &str, class: Option<&str>, func: &str) -> Option<NativeFn> {
    registry().get(&(module, class, func)).copied()
}

fn os_getuid(_args: Vec<Value>, _kwargs: Vec<(Value, Value)>) -> CallResult {
    // SAFETY: getuid takes no arguments and cannot fail.
    let uid = unsafe { libc::getuid() };
    Ok(Value::Int(i64::from(uid)))
}

fn os_getpid(_args: Vec<Value>, _kwargs: Vec<(Value, Value)>) -> CallResult {
    Ok(Value::Int(i64::from(std::process::id())))
}

fn os_getcwd(_args: Vec<Value>, _kwargs: Vec<(Value, Value)>) -> CallResult {
    match std::env::current_dir() {
        Ok(path) => Ok(Value::Text(path.to_string_lossy().into_owned())),
        Err(e) => Err(CallError::new(format!("OSError: {e}"))),
    }
}

fn builtins_echo(args: Vec<Value>, _kwargs: Vec<(Value, Value)>) -> CallResult {
    Ok(args.into_iter().next().unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_function() {
        assert!(lookup_function("os", None, "getuid").is_some());
        assert!(lookup_function("os", None, "nonexistent").is_none());
        assert!(lookup_function("nonexistent", None, "getuid").is_none());
    }

    #[test]
    fn getuid_matches_real_uid() {
        let f = lookup_function("os", None, "getuid").expect("registered");
        let Value::Int(uid) = f(vec![], vec![]).expect("no error") else {
            panic!("expected Int");
        };
        // SAFETY: getuid takes no arguments and cannot fail.
        assert_eq!(uid, i64::from(unsafe { libc::getuid() }));
    }
}
