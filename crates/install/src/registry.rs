//! HKCU\Environment Path read-modify-write with value-type preservation.
//!
//! Registry contention from other processes cannot be prevented, so the
//! reader tolerates one concurrent writer: size and type are re-fetched on
//! `ERROR_MORE_DATA`, on a type change between query and read, and on a
//! size that grew past the buffer, bounded at three read attempts. All
//! control flow is written against [`PathValueSource`] so the retry logic
//! is unit-testable without a registry; the Win32 implementation lives at
//! the bottom behind `cfg(windows)`.

use std::sync::Mutex;

use once_cell::sync::Lazy;
use thiserror::Error;

/// Upper bound on the raw Path value; a user PATH near 64 KiB is corrupt.
pub const MAX_REGISTRY_PATH_RAW_SIZE: usize = 64 * 1024;
const MAX_READ_ATTEMPTS: u32 = 3;

/// Serializes every PATH mutation in this process: registry writes and the
/// in-memory PATH variable must not race each other.
pub(crate) static ENSURE_PATH_MUTEX: Lazy<Mutex<()>> = Lazy::new(Mutex::default);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry Path value too large: {0} bytes")]
    ValueTooLarge(usize),
    #[error("unsupported registry value type {0}")]
    UnsupportedType(u32),
    #[error("registry read retry limit exceeded")]
    RetryLimitExceeded,
    #[error("PATH entry must not be blank")]
    BlankEntry,
    #[error("registry {operation} failed with code {code}")]
    Win32 { operation: &'static str, code: u32 },
}

/// Registry string value types; `None` means the value does not exist yet.
/// Unknown types carry their raw code so the writer can reject them
/// explicitly instead of silently coercing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathValueType {
    None,
    Sz,
    ExpandSz,
    Other(u32),
}

impl PathValueType {
    pub fn is_string(self) -> bool {
        matches!(self, PathValueType::Sz | PathValueType::ExpandSz)
    }
}

/// One read step against the Path value.
#[derive(Debug)]
pub enum ReadOutcome {
    Data {
        /// Bytes written into the buffer. An implementation may
        /// report more than the buffer holds; the reader re-sizes then.
        len: usize,
        value_type: PathValueType,
    },
    /// The value grew between the size query and the read.
    MoreData,
}

/// Size/type query and buffered read over the Path value. Implemented by
/// the Win32 key below and by mocks in tests.
pub trait PathValueSource {
    fn query_size_type(&mut self) -> Result<(usize, PathValueType), RegistryError>;
    fn read_value(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, RegistryError>;
}

/// Read the raw Path value, retrying on size/type churn.
pub fn read_path_value(
    source: &mut dyn PathValueSource,
) -> Result<(Vec<u8>, PathValueType), RegistryError> {
    let (mut size, mut value_type) = validated_size_type(source.query_size_type()?)?;
    if value_type == PathValueType::None {
        return Ok((Vec::new(), PathValueType::None));
    }

    for _ in 0..MAX_READ_ATTEMPTS {
        let mut buf = vec![0u8; size];
        match source.read_value(&mut buf)? {
            ReadOutcome::MoreData => {
                (size, value_type) = validated_size_type(source.query_size_type()?)?;
            }
            ReadOutcome::Data {
                len,
                value_type: read_type,
            } => {
                if read_type != value_type {
                    // type churned between query and read: refresh once more
                    (size, value_type) = validated_size_type(source.query_size_type()?)?;
                    continue;
                }
                if len > buf.len() {
                    if !read_type.is_string() {
                        return Err(RegistryError::UnsupportedType(raw_type(read_type)));
                    }
                    size = len;
                    continue;
                }
                buf.truncate(len);
                return Ok((buf, value_type));
            }
        }
    }
    Err(RegistryError::RetryLimitExceeded)
}

fn validated_size_type(
    (size, value_type): (usize, PathValueType),
) -> Result<(usize, PathValueType), RegistryError> {
    if size > MAX_REGISTRY_PATH_RAW_SIZE {
        return Err(RegistryError::ValueTooLarge(size));
    }
    match value_type {
        PathValueType::None | PathValueType::Sz | PathValueType::ExpandSz => Ok((size, value_type)),
        PathValueType::Other(raw) => Err(RegistryError::UnsupportedType(raw)),
    }
}

fn raw_type(value_type: PathValueType) -> u32 {
    match value_type {
        PathValueType::None => 0,
        PathValueType::Sz => 1,
        PathValueType::ExpandSz => 2,
        PathValueType::Other(raw) => raw,
    }
}

/// Decode a raw registry string value: UTF-16LE, tolerant of an odd
/// trailing byte and a leading BOM, truncated at the first NUL.
pub fn decode_path_value(raw: &[u8]) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let even_len = raw.len() - (raw.len() % 2);
    if even_len != raw.len() {
        tracing::warn!(len = raw.len(), "odd-length registry Path value, truncating final byte");
    }

    let mut units: Vec<u16> = raw[..even_len]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    if let Some(nul) = units.iter().position(|&u| u == 0) {
        units.truncate(nul);
    }
    if units.first() == Some(&0xFEFF) {
        units.remove(0);
    }
    String::from_utf16_lossy(&units)
}

/// Case-insensitive membership test over a semicolon-joined PATH value.
/// Blank and dot-only entries are skipped; a blank `dir` never matches.
pub fn contains_path_entry(value: &str, dir: &str) -> bool {
    contains_path_entry_sep(value, dir, ';')
}

pub(crate) fn contains_path_entry_sep(value: &str, dir: &str, sep: char) -> bool {
    let needle = normalize_entry(dir);
    if needle.is_empty() {
        return false;
    }
    value.split(sep).any(|entry| {
        let normalized = normalize_entry(entry);
        !normalized.is_empty() && normalized == needle
    })
}

/// Lexically normalized, lowercased comparison key for one PATH entry.
/// `.` components drop out; a dot-only entry normalizes to empty.
pub(crate) fn normalize_entry(entry: &str) -> String {
    let trimmed = entry.trim().trim_matches('"');
    let mut components: Vec<String> = Vec::new();
    for component in trimmed.split(['\\', '/']) {
        match component {
            "" | "." => continue,
            ".." => {
                components.pop();
            }
            other => components.push(other.to_ascii_lowercase()),
        }
    }
    components.join("/")
}

/// Append `dir` to a semicolon-joined value, stripping trailing
/// semicolons first.
pub fn append_path_entry(current: &str, dir: &str) -> String {
    let trimmed = current.trim_end_matches(';');
    if trimmed.is_empty() {
        dir.to_string()
    } else {
        format!("{trimmed};{dir}")
    }
}

/// Drop every entry matching `dir` (case-insensitive, normalized); blank
/// entries are dropped as well. `None` when nothing changed, and when the
/// removal target normalizes to nothing (safeguard against clearing the
/// whole value).
pub fn remove_path_entries(current: &str, dir: &str) -> Option<String> {
    let needle = normalize_entry(dir);
    if needle.is_empty() {
        return None;
    }
    remove_path_entries_matching(current, |entry| normalize_entry(entry) == needle)
        .map(|(value, _)| value)
}

/// Drop entries matching a predicate; returns the new value and the count
/// removed, or `None` when nothing changed.
pub fn remove_path_entries_matching(
    current: &str,
    matches: impl Fn(&str) -> bool,
) -> Option<(String, usize)> {
    let mut kept: Vec<&str> = Vec::new();
    let mut removed = 0;
    for entry in current.split(';') {
        if entry.trim().is_empty() {
            continue;
        }
        if matches(entry) {
            removed += 1;
        } else {
            kept.push(entry);
        }
    }
    if removed == 0 {
        return None;
    }
    Some((kept.join(";"), removed))
}

/// Pick the type to write back: preserve an existing string type,
/// auto-detect for a fresh value, propagate anything else for the writer
/// to reject.
pub fn choose_value_type(current: PathValueType, new_value: &str) -> PathValueType {
    match current {
        PathValueType::Sz | PathValueType::ExpandSz | PathValueType::Other(_) => current,
        PathValueType::None => {
            if new_value.contains('%') {
                PathValueType::ExpandSz
            } else {
                PathValueType::Sz
            }
        }
    }
}

/// Idempotently register `dir` on the user PATH in the registry. Returns
/// whether a write happened. The whole read-modify-write runs under one
/// key handle and the process-wide PATH mutex; the settings broadcast is
/// best-effort.
#[cfg(windows)]
pub fn ensure_path_contains(dir: &str) -> Result<bool, RegistryError> {
    let _guard = ENSURE_PATH_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    ensure_path_contains_locked(dir)
}

#[cfg(windows)]
pub(crate) fn ensure_path_contains_locked(dir: &str) -> Result<bool, RegistryError> {
    let dir = dir.trim();
    if dir.is_empty() {
        return Err(RegistryError::BlankEntry);
    }

    let mut key = win::EnvironmentKey::open()?;
    let (raw, value_type) = read_path_value(&mut key.path_source())?;
    let current = decode_path_value(&raw);

    if contains_path_entry(&current, dir) {
        return Ok(false);
    }

    let new_value = append_path_entry(&current, dir);
    let target_type = choose_value_type(value_type, &new_value);
    key.write_path(&new_value, target_type)?;
    drop(key);

    if let Err(err) = crate::broadcast::notify_environment_change() {
        tracing::warn!(error = %err, "environment change broadcast failed");
    }
    Ok(true)
}

/// Off Windows there is no registry half; the process PATH update is the
/// whole story.
#[cfg(not(windows))]
pub fn ensure_path_contains(dir: &str) -> Result<bool, RegistryError> {
    let _guard = ENSURE_PATH_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    if dir.trim().is_empty() {
        return Err(RegistryError::BlankEntry);
    }
    Ok(false)
}

#[cfg(windows)]
pub(crate) mod win {
    //! Win32 implementation of the Path value source and writer.

    use super::{PathValueSource, PathValueType, ReadOutcome, RegistryError};
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{ERROR_FILE_NOT_FOUND, ERROR_MORE_DATA, ERROR_SUCCESS};
    use windows::Win32::System::Registry::{
        RegCloseKey, RegCreateKeyExW, RegQueryValueExW, RegSetValueExW, HKEY, HKEY_CURRENT_USER,
        KEY_QUERY_VALUE, KEY_SET_VALUE, REG_EXPAND_SZ, REG_OPTION_NON_VOLATILE, REG_SZ,
        REG_VALUE_TYPE,
    };

    const SUBKEY: &str = "Environment";
    const VALUE_NAME: &str = "Path";

    pub struct EnvironmentKey {
        handle: HKEY,
    }

    impl EnvironmentKey {
        /// Open (creating if missing) HKCU\Environment with query+set
        /// access.
        pub fn open() -> Result<Self, RegistryError> {
            let subkey = wide(SUBKEY);
            let mut handle = HKEY::default();
            let status = unsafe {
                RegCreateKeyExW(
                    HKEY_CURRENT_USER,
                    PCWSTR(subkey.as_ptr()),
                    0,
                    PCWSTR::null(),
                    REG_OPTION_NON_VOLATILE,
                    KEY_QUERY_VALUE | KEY_SET_VALUE,
                    None,
                    &mut handle,
                    None,
                )
            };
            if status != ERROR_SUCCESS {
                return Err(RegistryError::Win32 {
                    operation: "open HKCU\\Environment",
                    code: status.0,
                });
            }
            Ok(Self { handle })
        }

        /// Open without creating; `Ok(None)` when the key does not exist.
        pub fn open_existing() -> Result<Option<Self>, RegistryError> {
            use windows::Win32::System::Registry::RegOpenKeyExW;

            let subkey = wide(SUBKEY);
            let mut handle = HKEY::default();
            let status = unsafe {
                RegOpenKeyExW(
                    HKEY_CURRENT_USER,
                    PCWSTR(subkey.as_ptr()),
                    0,
                    KEY_QUERY_VALUE | KEY_SET_VALUE,
                    &mut handle,
                )
            };
            if status == ERROR_FILE_NOT_FOUND {
                return Ok(None);
            }
            if status != ERROR_SUCCESS {
                return Err(RegistryError::Win32 {
                    operation: "open HKCU\\Environment",
                    code: status.0,
                });
            }
            Ok(Some(Self { handle }))
        }

        pub fn path_source(&mut self) -> PathSource<'_> {
            PathSource { key: self }
        }

        pub fn write_path(
            &mut self,
            value: &str,
            value_type: PathValueType,
        ) -> Result<(), RegistryError> {
            let reg_type = match value_type {
                PathValueType::Sz => REG_SZ,
                PathValueType::ExpandSz => REG_EXPAND_SZ,
                PathValueType::None => REG_SZ,
                PathValueType::Other(raw) => return Err(RegistryError::UnsupportedType(raw)),
            };
            let name = wide(VALUE_NAME);
            let data = wide(value);
            let bytes: &[u8] = unsafe {
                std::slice::from_raw_parts(data.as_ptr() as *const u8, data.len() * 2)
            };
            let status = unsafe {
                RegSetValueExW(self.handle, PCWSTR(name.as_ptr()), 0, reg_type, Some(bytes))
            };
            if status != ERROR_SUCCESS {
                return Err(RegistryError::Win32 {
                    operation: "write Path",
                    code: status.0,
                });
            }
            Ok(())
        }
    }

    impl Drop for EnvironmentKey {
        fn drop(&mut self) {
            unsafe {
                let _ = RegCloseKey(self.handle);
            }
        }
    }

    pub struct PathSource<'a> {
        key: &'a EnvironmentKey,
    }

    impl PathValueSource for PathSource<'_> {
        fn query_size_type(&mut self) -> Result<(usize, PathValueType), RegistryError> {
            let name = wide(VALUE_NAME);
            let mut value_type = REG_VALUE_TYPE::default();
            let mut size: u32 = 0;
            let status = unsafe {
                RegQueryValueExW(
                    self.key.handle,
                    PCWSTR(name.as_ptr()),
                    None,
                    Some(&mut value_type as *mut REG_VALUE_TYPE),
                    None,
                    Some(&mut size as *mut u32),
                )
            };
            if status == ERROR_FILE_NOT_FOUND {
                return Ok((0, PathValueType::None));
            }
            if status != ERROR_SUCCESS {
                return Err(RegistryError::Win32 {
                    operation: "query Path size",
                    code: status.0,
                });
            }
            Ok((size as usize, convert_type(value_type)))
        }

        fn read_value(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, RegistryError> {
            let name = wide(VALUE_NAME);
            let mut value_type = REG_VALUE_TYPE::default();
            let mut size: u32 = buf.len() as u32;
            let status = unsafe {
                RegQueryValueExW(
                    self.key.handle,
                    PCWSTR(name.as_ptr()),
                    None,
                    Some(&mut value_type as *mut REG_VALUE_TYPE),
                    Some(buf.as_mut_ptr()),
                    Some(&mut size as *mut u32),
                )
            };
            if status == ERROR_MORE_DATA {
                return Ok(ReadOutcome::MoreData);
            }
            if status != ERROR_SUCCESS {
                return Err(RegistryError::Win32 {
                    operation: "read Path",
                    code: status.0,
                });
            }
            Ok(ReadOutcome::Data {
                len: size as usize,
                value_type: convert_type(value_type),
            })
        }
    }

    fn convert_type(value_type: REG_VALUE_TYPE) -> PathValueType {
        if value_type == REG_SZ {
            PathValueType::Sz
        } else if value_type == REG_EXPAND_SZ {
            PathValueType::ExpandSz
        } else {
            PathValueType::Other(value_type.0)
        }
    }

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted mock source: a queue of query answers and read outcomes.
    struct MockSource {
        queries: Vec<(usize, PathValueType)>,
        reads: Vec<MockRead>,
        query_calls: usize,
    }

    enum MockRead {
        Data(Vec<u8>, PathValueType),
        OversizedData(usize, PathValueType),
        MoreData,
    }

    impl MockSource {
        fn new(queries: Vec<(usize, PathValueType)>, reads: Vec<MockRead>) -> Self {
            Self {
                queries,
                reads,
                query_calls: 0,
            }
        }
    }

    impl PathValueSource for MockSource {
        fn query_size_type(&mut self) -> Result<(usize, PathValueType), RegistryError> {
            self.query_calls += 1;
            Ok(self.queries.remove(0))
        }

        fn read_value(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, RegistryError> {
            match self.reads.remove(0) {
                MockRead::Data(bytes, value_type) => {
                    let len = bytes.len().min(buf.len());
                    buf[..len].copy_from_slice(&bytes[..len]);
                    Ok(ReadOutcome::Data {
                        len: bytes.len(),
                        value_type,
                    })
                }
                MockRead::OversizedData(len, value_type) => {
                    Ok(ReadOutcome::Data { len, value_type })
                }
                MockRead::MoreData => Ok(ReadOutcome::MoreData),
            }
        }
    }

    fn utf16_bytes(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(u16::to_le_bytes).collect()
    }

    #[test]
    fn reads_simple_value() {
        let bytes = utf16_bytes("C:\\bin");
        let mut source = MockSource::new(
            vec![(bytes.len(), PathValueType::Sz)],
            vec![MockRead::Data(bytes.clone(), PathValueType::Sz)],
        );
        let (raw, value_type) = read_path_value(&mut source).unwrap();
        assert_eq!(raw, bytes);
        assert_eq!(value_type, PathValueType::Sz);
        assert_eq!(source.query_calls, 1);
    }

    #[test]
    fn missing_value_reads_as_empty_none() {
        let mut source = MockSource::new(vec![(0, PathValueType::None)], vec![]);
        let (raw, value_type) = read_path_value(&mut source).unwrap();
        assert!(raw.is_empty());
        assert_eq!(value_type, PathValueType::None);
    }

    #[test]
    fn more_data_triggers_exactly_one_size_refresh() {
        let bytes = utf16_bytes("A");
        let mut source = MockSource::new(
            vec![(0, PathValueType::ExpandSz), (bytes.len(), PathValueType::ExpandSz)],
            vec![
                MockRead::MoreData,
                MockRead::Data(bytes.clone(), PathValueType::ExpandSz),
            ],
        );
        let (raw, value_type) = read_path_value(&mut source).unwrap();
        assert_eq!(decode_path_value(&raw), "A");
        assert_eq!(value_type, PathValueType::ExpandSz);
        // initial query plus one refresh
        assert_eq!(source.query_calls, 2);
    }

    #[test]
    fn type_churn_refreshes_and_retries() {
        let bytes = utf16_bytes("B");
        let mut source = MockSource::new(
            vec![(bytes.len(), PathValueType::Sz), (bytes.len(), PathValueType::ExpandSz)],
            vec![
                MockRead::Data(bytes.clone(), PathValueType::ExpandSz),
                MockRead::Data(bytes.clone(), PathValueType::ExpandSz),
            ],
        );
        let (_, value_type) = read_path_value(&mut source).unwrap();
        assert_eq!(value_type, PathValueType::ExpandSz);
        assert_eq!(source.query_calls, 2);
    }

    #[test]
    fn oversized_read_resizes_and_retries() {
        let bytes = utf16_bytes("grown");
        let mut source = MockSource::new(
            vec![(2, PathValueType::Sz)],
            vec![
                MockRead::OversizedData(bytes.len(), PathValueType::Sz),
                MockRead::Data(bytes.clone(), PathValueType::Sz),
            ],
        );
        let (raw, _) = read_path_value(&mut source).unwrap();
        assert_eq!(decode_path_value(&raw), "grown");
    }

    #[test]
    fn persistent_churn_exhausts_the_retry_budget() {
        let mut source = MockSource::new(
            vec![(4, PathValueType::Sz); 4],
            vec![MockRead::MoreData, MockRead::MoreData, MockRead::MoreData],
        );
        let err = read_path_value(&mut source).unwrap_err();
        assert!(matches!(err, RegistryError::RetryLimitExceeded));
    }

    #[test]
    fn unsupported_type_fails() {
        let mut source = MockSource::new(vec![(4, PathValueType::Other(3))], vec![]);
        let err = read_path_value(&mut source).unwrap_err();
        assert!(matches!(err, RegistryError::UnsupportedType(3)));
    }

    #[test]
    fn oversized_value_fails() {
        let mut source = MockSource::new(
            vec![(MAX_REGISTRY_PATH_RAW_SIZE + 1, PathValueType::Sz)],
            vec![],
        );
        let err = read_path_value(&mut source).unwrap_err();
        assert!(matches!(err, RegistryError::ValueTooLarge(_)));
    }

    #[test]
    fn decode_handles_bom_odd_length_and_nul() {
        assert_eq!(decode_path_value(&[]), "");

        let mut with_bom = utf16_bytes("\u{feff}C:\\bin");
        assert_eq!(decode_path_value(&with_bom), "C:\\bin");

        // odd trailing byte is dropped
        with_bom.push(0xAB);
        assert_eq!(decode_path_value(&with_bom), "C:\\bin");

        let mut with_nul = utf16_bytes("C:\\bin");
        with_nul.extend(utf16_bytes("\0ignored"));
        assert_eq!(decode_path_value(&with_nul), "C:\\bin");
    }

    #[test]
    fn contains_matches_case_insensitively_after_cleaning() {
        let value = r"C:\Windows;C:\Users\a\bin\;.;  ;D:\tools";
        assert!(contains_path_entry(value, r"c:\users\a\bin"));
        assert!(contains_path_entry(value, r"C:\USERS\A\BIN\"));
        assert!(contains_path_entry(value, "D:/tools"));
        assert!(!contains_path_entry(value, r"C:\users"));
        // blank input entry never matches, dot-only entries are skipped
        assert!(!contains_path_entry(value, ""));
        assert!(!contains_path_entry(value, " . "));
    }

    #[test]
    fn append_strips_trailing_semicolons() {
        assert_eq!(append_path_entry("", r"C:\bin"), r"C:\bin");
        assert_eq!(append_path_entry(r"C:\a;;", r"C:\bin"), r"C:\a;C:\bin");
        assert_eq!(append_path_entry(r"C:\a", r"C:\bin"), r"C:\a;C:\bin");
    }

    #[test]
    fn remove_drops_all_matches_and_blanks() {
        let value = r"C:\keep;C:\old\bin;;c:\OLD\BIN\;D:\other";
        let removed = remove_path_entries(value, r"C:\old\bin").unwrap();
        assert_eq!(removed, r"C:\keep;D:\other");

        assert!(remove_path_entries(value, r"E:\absent").is_none());
        // a dot-only removal target is refused
        assert!(remove_path_entries(value, ".").is_none());
    }

    #[test]
    fn value_type_choice_preserves_and_detects() {
        assert_eq!(
            choose_value_type(PathValueType::Sz, "%HOME%"),
            PathValueType::Sz
        );
        assert_eq!(
            choose_value_type(PathValueType::ExpandSz, "plain"),
            PathValueType::ExpandSz
        );
        assert_eq!(
            choose_value_type(PathValueType::None, r"C:\plain"),
            PathValueType::Sz
        );
        assert_eq!(
            choose_value_type(PathValueType::None, r"%LOCALAPPDATA%\bin"),
            PathValueType::ExpandSz
        );
        assert_eq!(
            choose_value_type(PathValueType::Other(7), "x"),
            PathValueType::Other(7)
        );
    }
}
