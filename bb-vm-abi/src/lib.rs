/// How a host answers a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    /// Returns before the next instruction runs.
    Sync,
    /// Suspends the program until the host supplies the result.
    Async,
    /// Suspends the program for a number of ticks.
    Delay,
}

impl CallKind {
    pub fn name(self) -> &'static str {
        match self {
            CallKind::Sync => "sync",
            CallKind::Async => "async",
            CallKind::Delay => "delay",
        }
    }
}

/// One entry of the standard console table. Types use the assembler's
/// type names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AbiFunction {
    pub id: i32,
    pub name: &'static str,
    pub parameters: &'static [&'static str],
    pub returns: Option<&'static str>,
    pub kind: CallKind,
}

pub const ABI_VERSION: u16 = 1;

pub const FN_PRINT_INT: i32 = 1;
pub const FN_PRINT_CHAR: i32 = 2;
pub const FN_PRINT_STR: i32 = 3;
pub const FN_READ_CHAR: i32 = 4;
pub const FN_SLEEP: i32 = 5;
pub const FN_ALLOC: i32 = 6;
pub const FN_FREE: i32 = 7;

pub const FUNCTIONS: [AbiFunction; 7] = [
    AbiFunction {
        id: FN_PRINT_INT,
        name: "print_int",
        parameters: &["i32"],
        returns: None,
        kind: CallKind::Sync,
    },
    AbiFunction {
        id: FN_PRINT_CHAR,
        name: "print_char",
        parameters: &["char"],
        returns: None,
        kind: CallKind::Sync,
    },
    AbiFunction {
        id: FN_PRINT_STR,
        name: "print_str",
        parameters: &["i32"],
        returns: None,
        kind: CallKind::Sync,
    },
    AbiFunction {
        id: FN_READ_CHAR,
        name: "read_char",
        parameters: &[],
        returns: Some("char"),
        kind: CallKind::Async,
    },
    AbiFunction {
        id: FN_SLEEP,
        name: "sleep",
        parameters: &["i32"],
        returns: None,
        kind: CallKind::Delay,
    },
    AbiFunction {
        id: FN_ALLOC,
        name: "alloc",
        parameters: &["i32"],
        returns: Some("i32"),
        kind: CallKind::Sync,
    },
    AbiFunction {
        id: FN_FREE,
        name: "free",
        parameters: &["i32"],
        returns: None,
        kind: CallKind::Sync,
    },
];

fn functions_by_name() -> &'static std::collections::HashMap<&'static str, &'static AbiFunction> {
    static LOOKUP: std::sync::OnceLock<
        std::collections::HashMap<&'static str, &'static AbiFunction>,
    > = std::sync::OnceLock::new();
    LOOKUP.get_or_init(|| {
        let mut map = std::collections::HashMap::with_capacity(FUNCTIONS.len());
        for function in FUNCTIONS.iter() {
            map.insert(function.name, function);
        }
        map
    })
}

pub fn function_by_id(id: i32) -> Option<&'static AbiFunction> {
    FUNCTIONS.iter().find(|function| function.id == id)
}

pub fn function_by_name(name: &str) -> Option<&'static AbiFunction> {
    functions_by_name().get(name).copied()
}

pub fn abi_json() -> &'static str {
    include_str!("../abi.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense_and_start_at_one() {
        for (position, function) in FUNCTIONS.iter().enumerate() {
            assert_eq!(function.id as usize, position + 1);
        }
    }

    #[test]
    fn lookups_agree() {
        for function in FUNCTIONS.iter() {
            assert_eq!(function_by_id(function.id), Some(function));
            assert_eq!(function_by_name(function.name), Some(function));
        }
        assert_eq!(function_by_id(0), None);
        assert_eq!(function_by_name("print"), None);
    }

    #[test]
    fn abi_json_matches_table() {
        let manifest = abi_json();
        assert!(manifest.contains(&format!("\"abi_version\": {ABI_VERSION}")));
        for function in FUNCTIONS {
            let entry = format!(
                "{{ \"id\": {}, \"name\": \"{}\"",
                function.id, function.name
            );
            assert!(manifest.contains(&entry), "missing {entry}");
            assert!(manifest.contains(&format!("\"kind\": \"{}\"", function.kind.name())));
        }
    }
}
