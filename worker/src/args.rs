//! Argument-vector parsing.
//!
//! The init signal carries the worker's argument vector:
//!
//! ```text
//! [worker name] [wasm file] --arg ARG_1 --arg ARG_2 ... --dir GUEST:REAL ...
//! ```
//!
//! Exactly one positional token names the executable. Repeatable `--arg`
//! entries become guest argv (after the executable name, which is always
//! argv\[0\]); repeatable `--dir` entries become preopened-directory
//! mappings, where a bare `$` for the guest path means "use the real path
//! unchanged".

use std::fmt;

/// Parsed worker arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    /// Path of the guest executable.
    pub exe_path: String,
    /// Guest argv; element 0 is always the executable path.
    pub guest_argv: Vec<String>,
    /// Preopened directories as (guest path, real path) pairs.
    pub preopens: Vec<(String, String)>,
}

/// Argument-vector errors. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgsError {
    /// No executable path was given.
    MissingExecutable,
    /// More than one positional token.
    ExtraExecutable { first: String, second: String },
    /// A flag was given without its value.
    MissingValue { flag: &'static str },
    /// A `--dir` mapping was not of the form `guest:real`.
    BadMapping { mapping: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingExecutable => write!(
                f,
                "missing wasm file name; expected: [worker] [wasm file] \
                 --arg NAME ... --dir GUEST:REAL ..."
            ),
            ArgsError::ExtraExecutable { first, second } => {
                write!(f, "two executables given: '{}' and '{}'", first, second)
            }
            ArgsError::MissingValue { flag } => write!(f, "flag {} needs a value", flag),
            ArgsError::BadMapping { mapping } => write!(
                f,
                "mapping '{}' is invalid; it should be <guest path>:<real path>",
                mapping
            ),
        }
    }
}

/// Parse the init argument vector. Element 0 is the worker's own name and is
/// skipped.
pub fn parse_worker_args(argv: &[String]) -> Result<WorkerArgs, ArgsError> {
    let mut exe_path: Option<String> = None;
    let mut guest_args: Vec<String> = Vec::new();
    let mut preopens: Vec<(String, String)> = Vec::new();

    let mut iter = argv.iter().skip(1).peekable();
    while let Some(token) = iter.next() {
        match token.as_str() {
            "--arg" => {
                let value = iter
                    .next()
                    .ok_or(ArgsError::MissingValue { flag: "--arg" })?;
                guest_args.push(value.clone());
            }
            "--dir" => {
                let value = iter
                    .next()
                    .ok_or(ArgsError::MissingValue { flag: "--dir" })?;
                let paths: Vec<&str> = value.split(':').collect();
                let &[guest, real] = &paths[..] else {
                    return Err(ArgsError::BadMapping {
                        mapping: value.clone(),
                    });
                };
                let guest = if guest == "$" {
                    log::info!("using $ shortcut to set guest path to: {}", real);
                    real
                } else {
                    guest
                };
                preopens.push((guest.into(), real.into()));
            }
            flag if flag.starts_with("--") => {
                log::warn!("ignoring unrecognized flag {}", flag);
                // The flag's value, if any, goes with it.
                if iter.peek().is_some_and(|v| !v.starts_with("--")) {
                    iter.next();
                }
            }
            positional => match &exe_path {
                None => exe_path = Some(positional.into()),
                Some(first) => {
                    return Err(ArgsError::ExtraExecutable {
                        first: first.clone(),
                        second: positional.into(),
                    })
                }
            },
        }
    }

    let exe_path = exe_path.ok_or(ArgsError::MissingExecutable)?;
    let mut guest_argv = vec![exe_path.clone()];
    guest_argv.append(&mut guest_args);
    Ok(WorkerArgs {
        exe_path,
        guest_argv,
        preopens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|s| String::from(*s)).collect()
    }

    #[test]
    fn test_minimal() {
        let parsed = parse_worker_args(&argv(&["worker", "prog.wasm"])).unwrap();
        assert_eq!(parsed.exe_path, "prog.wasm");
        assert_eq!(parsed.guest_argv, ["prog.wasm"]);
        assert!(parsed.preopens.is_empty());
    }

    #[test]
    fn test_args_follow_exe_name() {
        let parsed =
            parse_worker_args(&argv(&["worker", "--arg", "-v", "prog.wasm", "--arg", "x"]))
                .unwrap();
        assert_eq!(parsed.guest_argv, ["prog.wasm", "-v", "x"]);
    }

    #[test]
    fn test_dir_mappings() {
        let parsed = parse_worker_args(&argv(&[
            "worker",
            "prog.wasm",
            "--dir",
            "/data:/srv/real",
            "--dir",
            "$:/tmp",
        ]))
        .unwrap();
        assert_eq!(
            parsed.preopens,
            [
                (String::from("/data"), String::from("/srv/real")),
                (String::from("/tmp"), String::from("/tmp")),
            ]
        );
    }

    #[test]
    fn test_missing_executable() {
        let err = parse_worker_args(&argv(&["worker", "--arg", "x"])).unwrap_err();
        assert_eq!(err, ArgsError::MissingExecutable);
    }

    #[test]
    fn test_extra_executable() {
        let err = parse_worker_args(&argv(&["worker", "a.wasm", "b.wasm"])).unwrap_err();
        assert!(matches!(err, ArgsError::ExtraExecutable { .. }));
    }

    #[test]
    fn test_bad_mapping() {
        let err = parse_worker_args(&argv(&["worker", "a.wasm", "--dir", "/only"])).unwrap_err();
        assert_eq!(
            err,
            ArgsError::BadMapping {
                mapping: String::from("/only")
            }
        );
        let err =
            parse_worker_args(&argv(&["worker", "a.wasm", "--dir", "a:b:c"])).unwrap_err();
        assert!(matches!(err, ArgsError::BadMapping { .. }));
    }

    #[test]
    fn test_flag_without_value() {
        let err = parse_worker_args(&argv(&["worker", "a.wasm", "--arg"])).unwrap_err();
        assert_eq!(err, ArgsError::MissingValue { flag: "--arg" });
    }

    #[test]
    fn test_unknown_flag_skipped_with_value() {
        let parsed =
            parse_worker_args(&argv(&["worker", "--debug", "on", "prog.wasm"])).unwrap();
        assert_eq!(parsed.exe_path, "prog.wasm");
    }
}
