//! Value types describing what to run and how it ended.
//!
//! Everything here is immutable once built and cheap to clone; the builders
//! follow the argv-style discipline: arguments and environment entries are
//! discrete values and are never joined into shell strings.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

/// Name of the variable used for executable lookup.
pub const PATH_VARIABLE: &str = "PATH";

/// Directories searched after `PATH` when resolving a named executable.
pub const DEFAULT_SEARCH_PATHS: [&str; 5] =
    ["/usr/bin", "/bin", "/usr/sbin", "/sbin", "/usr/local/bin"];

// ============================================================================
// StringOrRawBytes
// ============================================================================

/// An argument or environment value: UTF-8 text or raw bytes.
///
/// Equality and hashing are defined on the underlying bytes, so
/// `"PATH"` and `b"PATH"` name the same environment variable.
#[derive(Debug, Clone, Eq)]
pub enum StringOrRawBytes {
    String(String),
    RawBytes(Vec<u8>),
}

impl StringOrRawBytes {
    /// The value as text, if it is valid UTF-8.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            Self::RawBytes(bytes) => std::str::from_utf8(bytes).ok(),
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::String(value) => value.as_bytes(),
            Self::RawBytes(bytes) => bytes,
        }
    }

    #[must_use]
    pub fn as_os_str(&self) -> &OsStr {
        OsStr::from_bytes(self.as_bytes())
    }

    /// True if the value contains an interior NUL and cannot cross `execve`.
    #[must_use]
    pub fn contains_nul(&self) -> bool {
        self.as_bytes().contains(&0)
    }
}

impl PartialEq for StringOrRawBytes {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Hash for StringOrRawBytes {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl fmt::Display for StringOrRawBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(value) => f.write_str(value),
            Self::RawBytes(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
        }
    }
}

impl From<&str> for StringOrRawBytes {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for StringOrRawBytes {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&String> for StringOrRawBytes {
    fn from(value: &String) -> Self {
        Self::String(value.clone())
    }
}

impl From<Vec<u8>> for StringOrRawBytes {
    fn from(value: Vec<u8>) -> Self {
        Self::RawBytes(value)
    }
}

impl From<&[u8]> for StringOrRawBytes {
    fn from(value: &[u8]) -> Self {
        Self::RawBytes(value.to_vec())
    }
}

impl From<OsString> for StringOrRawBytes {
    fn from(value: OsString) -> Self {
        match value.into_string() {
            Ok(text) => Self::String(text),
            Err(raw) => Self::RawBytes(raw.into_vec()),
        }
    }
}

impl From<&OsStr> for StringOrRawBytes {
    fn from(value: &OsStr) -> Self {
        Self::from(value.to_os_string())
    }
}

// ============================================================================
// Executable
// ============================================================================

/// The program to run: a name resolved through `PATH`, or an explicit path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Executable {
    Named(String),
    Path(PathBuf),
}

impl Executable {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    /// Resolve the path that will be handed to `execve`.
    ///
    /// A path is used as given. A name is used directly when it already points
    /// at an executable file, otherwise the first executable match is taken
    /// from the environment's `PATH` entries followed by
    /// [`DEFAULT_SEARCH_PATHS`].
    #[must_use]
    pub fn resolve_executable_path(&self, environment: &Environment) -> Option<PathBuf> {
        self.resolve_in(environment, Path::new("."))
    }

    pub(crate) fn resolve_in(&self, environment: &Environment, cwd: &Path) -> Option<PathBuf> {
        match self {
            Self::Path(path) => Some(path.clone()),
            Self::Named(name) => {
                if name.contains('/') {
                    return which::which_in(name, None::<&OsStr>, cwd).ok();
                }
                let search_path = search_path(environment.path_value());
                which::which_in(name, Some(search_path), cwd).ok()
            }
        }
    }
}

impl fmt::Display for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// `PATH` entries first, then the default directories not already listed.
fn search_path(path_value: Option<OsString>) -> OsString {
    let mut entries: Vec<PathBuf> = path_value
        .as_deref()
        .map(|value| {
            std::env::split_paths(value)
                .filter(|entry| !entry.as_os_str().is_empty())
                .collect()
        })
        .unwrap_or_default();
    for default in DEFAULT_SEARCH_PATHS {
        let default = PathBuf::from(default);
        if !entries.contains(&default) {
            entries.push(default);
        }
    }
    std::env::join_paths(entries).unwrap_or_else(|_| OsString::from(DEFAULT_SEARCH_PATHS.join(":")))
}

// ============================================================================
// Arguments
// ============================================================================

/// Ordered argument list, with an optional replacement for `argv[0]`.
///
/// # Example
///
/// ```rust
/// use xspawn_runner::Arguments;
///
/// let args = Arguments::from(["-n", "hello"]).arg("world");
/// assert_eq!(args.len(), 3);
/// assert!(args.executable_path_override().is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Arguments {
    values: Vec<StringOrRawBytes>,
    executable_path_override: Option<StringOrRawBytes>,
}

impl Arguments {
    #[must_use]
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StringOrRawBytes>,
    {
        Self {
            values: values.into_iter().map(Into::into).collect(),
            executable_path_override: None,
        }
    }

    /// Arguments whose `argv[0]` is `executable_path_override` instead of the
    /// resolved executable path.
    #[must_use]
    pub fn with_executable_path_override<O, I, S>(
        executable_path_override: Option<O>,
        remaining_values: I,
    ) -> Self
    where
        O: Into<StringOrRawBytes>,
        I: IntoIterator<Item = S>,
        S: Into<StringOrRawBytes>,
    {
        Self {
            values: remaining_values.into_iter().map(Into::into).collect(),
            executable_path_override: executable_path_override.map(Into::into),
        }
    }

    /// Append a single argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<StringOrRawBytes>) -> Self {
        self.values.push(value.into());
        self
    }

    #[must_use]
    pub fn values(&self) -> &[StringOrRawBytes] {
        &self.values
    }

    #[must_use]
    pub fn executable_path_override(&self) -> Option<&StringOrRawBytes> {
        self.executable_path_override.as_ref()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<S: Into<StringOrRawBytes>> FromIterator<S> for Arguments {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl<S: Into<StringOrRawBytes>, const N: usize> From<[S; N]> for Arguments {
    fn from(values: [S; N]) -> Self {
        Self::new(values)
    }
}

impl<S: Into<StringOrRawBytes>> From<Vec<S>> for Arguments {
    fn from(values: Vec<S>) -> Self {
        Self::new(values)
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Environment handed to the child.
///
/// `Inherit` starts from the parent's environment and applies the overrides
/// on top (an override replaces an inherited variable of the same name).
/// `Custom` passes exactly the given variables and nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Inherit(HashMap<StringOrRawBytes, StringOrRawBytes>),
    Custom(HashMap<StringOrRawBytes, StringOrRawBytes>),
}

impl Default for Environment {
    fn default() -> Self {
        Self::inherit()
    }
}

impl Environment {
    #[must_use]
    pub fn inherit() -> Self {
        Self::Inherit(HashMap::new())
    }

    #[must_use]
    pub fn custom<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<StringOrRawBytes>,
        V: Into<StringOrRawBytes>,
    {
        Self::Custom(
            values
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }

    /// Add or replace variables, keeping the inherit/custom mode.
    #[must_use]
    pub fn updating<I, K, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<StringOrRawBytes>,
        V: Into<StringOrRawBytes>,
    {
        let map = match &mut self {
            Self::Inherit(map) | Self::Custom(map) => map,
        };
        for (key, value) in values {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// The entries set explicitly (overrides for `Inherit`, everything for `Custom`).
    #[must_use]
    pub fn entries(&self) -> &HashMap<StringOrRawBytes, StringOrRawBytes> {
        match self {
            Self::Inherit(map) | Self::Custom(map) => map,
        }
    }

    /// The `PATH` value executable lookup will use.
    #[must_use]
    pub fn path_value(&self) -> Option<OsString> {
        let key = StringOrRawBytes::from(PATH_VARIABLE);
        match self {
            Self::Inherit(overrides) => overrides
                .get(&key)
                .map(|value| value.as_os_str().to_os_string())
                .or_else(|| std::env::var_os(PATH_VARIABLE)),
            Self::Custom(values) => values.get(&key).map(|value| value.as_os_str().to_os_string()),
        }
    }

    pub(crate) fn apply(&self, command: &mut tokio::process::Command) {
        if matches!(self, Self::Custom(_)) {
            command.env_clear();
        }
        for (key, value) in self.entries() {
            command.env(key.as_os_str(), value.as_os_str());
        }
    }
}

// ============================================================================
// Process identity and termination
// ============================================================================

/// Operating-system process id of a spawned child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessIdentifier(i32);

impl ProcessIdentifier {
    pub(crate) const fn new(value: i32) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ProcessIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the child ended: a normal exit code or the signal that killed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "code")]
pub enum TerminationStatus {
    Exited(i32),
    UnhandledException(i32),
}

impl TerminationStatus {
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Exited(0))
    }

    #[must_use]
    pub const fn is_unhandled_exception(self) -> bool {
        matches!(self, Self::UnhandledException(_))
    }
}

impl From<ExitStatus> for TerminationStatus {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(signal)) => Self::UnhandledException(signal),
            (None, None) => Self::Exited(status.into_raw()),
        }
    }
}

impl fmt::Display for TerminationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited({code})"),
            Self::UnhandledException(signal) => write!(f, "unhandled exception({signal})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_string_and_raw_bytes_compare_by_bytes() {
        let text = StringOrRawBytes::from("PATH");
        let raw = StringOrRawBytes::from(b"PATH".to_vec());
        assert_eq!(text, raw);
        assert_eq!(hash_of(&text), hash_of(&raw));
        assert_eq!(raw.as_str(), Some("PATH"));
    }

    #[test]
    fn test_invalid_utf8_has_no_str_view() {
        let raw = StringOrRawBytes::from(vec![0xff, 0xfe]);
        assert!(raw.as_str().is_none());
        assert_eq!(raw.as_bytes(), &[0xff, 0xfe]);
        assert!(!raw.to_string().is_empty());
    }

    #[test]
    fn test_contains_nul() {
        assert!(StringOrRawBytes::from(vec![b'a', 0, b'b']).contains_nul());
        assert!(!StringOrRawBytes::from("abc").contains_nul());
    }

    #[test]
    fn test_executable_display() {
        assert_eq!(Executable::named("echo").to_string(), "echo");
        assert_eq!(Executable::at("/bin/echo").to_string(), "/bin/echo");
    }

    #[test]
    fn test_executable_path_resolves_as_given() {
        let exe = Executable::at("/does/not/matter");
        assert_eq!(
            exe.resolve_executable_path(&Environment::inherit()),
            Some(PathBuf::from("/does/not/matter"))
        );
    }

    #[test]
    fn test_named_executable_falls_back_to_default_search_paths() {
        // An empty custom environment has no PATH; `sh` lives in a default directory.
        let env = Environment::custom(Vec::<(String, String)>::new());
        let resolved = Executable::named("sh").resolve_executable_path(&env);
        let resolved = resolved.expect("sh should resolve through the default search paths");
        assert!(resolved.ends_with("sh"));
    }

    #[test]
    fn test_named_executable_not_found() {
        let exe = Executable::named("this_command_definitely_does_not_exist_12345");
        assert!(exe.resolve_executable_path(&Environment::inherit()).is_none());
    }

    #[test]
    fn test_search_path_appends_defaults_once() {
        let path = search_path(Some(OsString::from("/opt/tools:/usr/bin")));
        let entries: Vec<PathBuf> = std::env::split_paths(&path).collect();
        assert_eq!(entries[0], PathBuf::from("/opt/tools"));
        assert_eq!(entries[1], PathBuf::from("/usr/bin"));
        assert_eq!(
            entries.iter().filter(|p| *p == Path::new("/usr/bin")).count(),
            1
        );
        assert!(entries.contains(&PathBuf::from("/usr/local/bin")));
    }

    #[test]
    fn test_arguments_builders() {
        let args = Arguments::from(["a", "b"]).arg(vec![0xffu8]);
        assert_eq!(args.len(), 3);
        assert_eq!(args.values()[0], StringOrRawBytes::from("a"));
        assert_eq!(args.values()[2].as_bytes(), &[0xff]);
        assert!(!args.is_empty());
        assert!(Arguments::default().is_empty());
    }

    #[test]
    fn test_arguments_executable_path_override() {
        let args = Arguments::with_executable_path_override(Some("custom-name"), ["x"]);
        assert_eq!(
            args.executable_path_override(),
            Some(&StringOrRawBytes::from("custom-name"))
        );
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn test_environment_updating_keeps_mode() {
        let env = Environment::inherit().updating([("A", "1")]).updating([("A", "2")]);
        assert!(matches!(env, Environment::Inherit(_)));
        assert_eq!(
            env.entries().get(&StringOrRawBytes::from("A")),
            Some(&StringOrRawBytes::from("2"))
        );

        let env = Environment::custom([("B", "1")]).updating([("C", "2")]);
        assert!(matches!(env, Environment::Custom(_)));
        assert_eq!(env.entries().len(), 2);
    }

    #[test]
    fn test_environment_path_value() {
        let custom = Environment::custom([("PATH", "/opt/bin")]);
        assert_eq!(custom.path_value(), Some(OsString::from("/opt/bin")));

        let empty = Environment::custom(Vec::<(String, String)>::new());
        assert!(empty.path_value().is_none());

        let overridden = Environment::inherit().updating([("PATH", "/x")]);
        assert_eq!(overridden.path_value(), Some(OsString::from("/x")));
    }

    #[test]
    fn test_termination_status_success() {
        assert!(TerminationStatus::Exited(0).is_success());
        assert!(!TerminationStatus::Exited(1).is_success());
        assert!(!TerminationStatus::UnhandledException(9).is_success());
        assert!(TerminationStatus::UnhandledException(9).is_unhandled_exception());
    }

    #[test]
    fn test_termination_status_from_exit_status() {
        // Raw wait statuses: exit code lives in the high byte, signal in the low bits.
        assert_eq!(
            TerminationStatus::from(ExitStatus::from_raw(3 << 8)),
            TerminationStatus::Exited(3)
        );
        assert_eq!(
            TerminationStatus::from(ExitStatus::from_raw(9)),
            TerminationStatus::UnhandledException(9)
        );
    }

    #[test]
    fn test_termination_status_serialization() {
        let json = serde_json::to_string(&TerminationStatus::Exited(1)).unwrap();
        assert_eq!(json, r#"{"kind":"exited","code":1}"#);
        let back: TerminationStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TerminationStatus::Exited(1));
    }
}
