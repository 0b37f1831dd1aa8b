//! Master-side catalogue of real, transferable module source (spec §4.8,
//! §8 S1/S2). Every entry here is genuine Lua text that a peer's
//! [`super::loader::ModuleLoader`] compiles and runs after fetching it
//! over `GET_MODULE` — nothing here is ever consulted by a peer locally,
//! even though the catalogue is linked into every binary by necessity of
//! static linking. Only [`super::responder::ModuleResponder`] (always
//! running at context 0, the master) is allowed to call [`find`]; peer-side
//! code must always resolve through the network round-trip so the
//! wire-visible behaviour (one `GET_MODULE` per fullname, cached after)
//! matches a master that actually owns the only copy of the source.
//!
//! This is distinct from [`super::registry`]: `os`/`builtins` there are
//! interpreter built-ins that ship with every peer the same way Python's
//! `os` module ships with every CPython install, so they never go through
//! `GET_MODULE` at all. Anything in this catalogue is user-authored
//! program code that the spec requires peers to receive lazily.

/// One real module's worth of served source.
pub struct ModuleSource {
    pub fullname: &'static str,
    pub is_package: bool,
    pub source: &'static str,
}

const CATALOGUE: &[ModuleSource] = &[
    ModuleSource {
        fullname: "pow",
        is_package: false,
        source: r#"
local function pow(base, exp)
    local result = 1
    for _ = 1, exp do
        result = result * base
    end
    return result
end

return { pow = pow }
"#,
    },
    ModuleSource {
        fullname: "pkg",
        is_package: true,
        source: r#"
return {}
"#,
    },
    ModuleSource {
        fullname: "pkg.a",
        is_package: false,
        source: r#"
local function add_one(x)
    return x + 1
end

return { add_one = add_one }
"#,
    },
    ModuleSource {
        fullname: "pkg.b",
        is_package: false,
        source: r#"
local a = require("pkg.a")

local function subtract_one_add_two(x)
    return a.add_one(x - 1) + 1
end

return { subtract_one_add_two = subtract_one_add_two }
"#,
    },
    ModuleSource {
        fullname: "arithmetic",
        is_package: false,
        source: r#"
local function divide(numerator, denominator)
    if denominator == 0 then
        error("ZeroDivisionError: division by zero in divide")
    end
    return numerator / denominator
end

return { divide = divide }
"#,
    },
];

/// Look up a served module by fully-qualified name.
#[must_use]
pub fn find(fullname: &str) -> Option<&'static ModuleSource> {
    CATALOGUE.iter().find(|m| m.fullname == fullname)
}

/// Lexically scan Lua source for `require("...")`/`require('...')` call
/// sites and return the referenced module names, in first-seen order with
/// duplicates removed (spec §9: "walk an AST... or serve a pre-computed
/// dependency manifest" — this is the textual middle ground between the
/// two, practical since the master is the one writing the source).
#[must_use]
pub fn scan_related(source: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = source;
    while let Some(pos) = rest.find("require") {
        rest = &rest[pos + "require".len()..];
        let mut chars = rest.trim_start();
        let Some(quote) = chars.strip_prefix('(').map(str::trim_start) else { continue };
        let quote_char = match quote.chars().next() {
            Some(c @ ('"' | '\'')) => c,
            _ => continue,
        };
        chars = &quote[1..];
        let Some(end) = chars.find(quote_char) else { continue };
        let name = &chars[..end];
        if !found.iter().any(|n: &String| n == name) {
            found.push(name.to_string());
        }
        rest = &chars[end + 1..];
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_known_modules() {
        assert!(find("pow").is_some());
        assert!(find("pkg.a").is_some());
        assert!(find("nonexistent").is_none());
    }

    #[test]
    fn scans_require_calls() {
        let related = scan_related(find("pkg.b").unwrap().source);
        assert_eq!(related, vec!["pkg.a".to_string()]);
    }

    #[test]
    fn scans_no_requires_when_absent() {
        assert!(scan_related(find("pow").unwrap().source).is_empty());
    }
}
