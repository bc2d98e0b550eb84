//! Locating the GPU engine instance that belongs to a process.
//!
//! Counter instances arrive as one flat buffer: every name is terminated by a
//! NUL byte and the list itself ends with an empty name, so a well formed
//! buffer ends in two NUL bytes (or is a single NUL for an empty list).
//!
//! ```text
//! pid_1204_luid_0x0_phys_0_eng_0_engtype_3D\0pid_1204_..._engtype_Copy\0\0
//! ```

use std::fmt;

/// Marker that precedes the decimal process id inside an instance name.
pub const PID_MARKER: &[u8] = b"pid_";
/// Suffix of instances that count the 3D rendering engine.
pub const ENGINE_3D_SUFFIX: &[u8] = b"engtype_3D";

/// One enumerated counter instance.
///
/// Instance names are only meaningful for the enumeration that produced them,
/// so a path is not `Clone` and is consumed by the query that uses it.
#[derive(Debug, PartialEq, Eq)]
pub struct GpuInstancePath(String);

impl GpuInstancePath {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GpuInstancePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Find the first 3D engine instance of `pid` in `instance_list`.
///
/// Returns `None` when nothing matches or when the buffer is not a properly
/// terminated list. The whole list is validated before any match is returned.
pub fn find_instance(pid: u64, instance_list: &[u8]) -> Option<GpuInstancePath> {
    let pid_digits = pid.to_string();
    split_instances(instance_list)?
        .into_iter()
        .find(|segment| has_pid(segment, pid_digits.as_bytes()) && is_3d_engine(segment))
        .and_then(|segment| std::str::from_utf8(segment).ok())
        .map(|name| GpuInstancePath(name.to_string()))
}

/// Split the buffer into instance names, stopping at the empty terminator.
/// `None` if a name or the list runs off the end of the buffer.
fn split_instances(buf: &[u8]) -> Option<Vec<&[u8]>> {
    let mut segments = Vec::new();
    let mut rest = buf;
    loop {
        let end = rest.iter().position(|&b| b == 0)?;
        if end == 0 {
            return Some(segments);
        }
        let (segment, tail) = rest.split_at(end);
        segments.push(segment);
        rest = &tail[1..];
    }
}

/// True if some `pid_` marker in `segment` is followed by exactly `pid_digits`.
fn has_pid(segment: &[u8], pid_digits: &[u8]) -> bool {
    if segment.len() < PID_MARKER.len() {
        return false;
    }
    (0..=segment.len() - PID_MARKER.len())
        .filter(|&at| &segment[at..at + PID_MARKER.len()] == PID_MARKER)
        .any(|at| {
            let digits = &segment[at + PID_MARKER.len()..];
            let run = digits.iter().take_while(|b| b.is_ascii_digit()).count();
            &digits[..run] == pid_digits
        })
}

fn is_3d_engine(segment: &[u8]) -> bool {
    segment.ends_with(ENGINE_3D_SUFFIX)
}

/// Builds a NUL delimited, doubly terminated instance list.
#[derive(Debug, Default)]
pub struct MultiStringBuilder {
    buf: Vec<u8>,
}

impl MultiStringBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one name. Empty names and names containing NUL would corrupt
    /// the list and are skipped; returns whether the name was added.
    pub fn push(&mut self, name: &str) -> bool {
        if name.is_empty() || name.as_bytes().contains(&0) {
            return false;
        }
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(0);
        true
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(0);
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn list(names: &[&str]) -> Vec<u8> {
        let mut builder = MultiStringBuilder::new();
        for name in names {
            assert!(builder.push(name));
        }
        builder.finish()
    }

    #[test]
    fn test_matches_pid_and_engine() {
        let buf = b"foo_pid_7_engtype_3D\0bar_pid_9_engtype_2D\0\0";
        let found = find_instance(7, buf).unwrap();
        assert_eq!(found.as_str(), "foo_pid_7_engtype_3D");
    }

    #[test]
    fn test_wrong_engine_type() {
        let buf = b"foo_pid_7_engtype_3D\0bar_pid_9_engtype_2D\0\0";
        assert!(find_instance(9, buf).is_none());
    }

    #[test]
    fn test_digit_boundary() {
        let buf = b"foo_pid_7_engtype_3D\0bar_pid_9_engtype_2D\0\0";
        assert!(find_instance(70, buf).is_none());

        let buf = list(&["pid_123_luid_0x1_phys_0_eng_0_engtype_3D"]);
        assert!(find_instance(12, &buf).is_none());
        assert!(find_instance(23, &buf).is_none());
        assert!(find_instance(123, &buf).is_some());
    }

    #[test]
    fn test_pid_at_end_of_name() {
        let buf = list(&["engtype_3D_pid_42"]);
        assert!(find_instance(42, &buf).is_none());

        let buf = list(&["x_pid_42engtype_3D"]);
        assert!(find_instance(42, &buf).is_some());
    }

    #[test]
    fn test_returns_first_match() {
        let buf = list(&[
            "pid_5_luid_0x1_phys_0_eng_1_engtype_Copy",
            "pid_5_luid_0x1_phys_0_eng_0_engtype_3D",
            "pid_5_luid_0x2_phys_0_eng_0_engtype_3D",
        ]);
        let found = find_instance(5, &buf).unwrap();
        assert_eq!(found.as_str(), "pid_5_luid_0x1_phys_0_eng_0_engtype_3D");
    }

    #[test]
    fn test_later_marker_can_match() {
        let buf = list(&["pid_1_parent_pid_88_engtype_3D"]);
        assert!(find_instance(88, &buf).is_some());
        assert!(find_instance(1, &buf).is_some());
    }

    #[test]
    fn test_suffix_is_case_sensitive_and_anchored() {
        let buf = list(&["pid_3_engtype_3d", "pid_3_engtype_3D_extra"]);
        assert!(find_instance(3, &buf).is_none());
    }

    #[test]
    fn test_empty_and_malformed_lists() {
        assert!(find_instance(7, b"").is_none());
        assert!(find_instance(7, b"\0").is_none());
        // Final name never terminated
        assert!(find_instance(7, b"pid_7_engtype_3D").is_none());
        // Terminated name but missing list terminator
        assert!(find_instance(7, b"pid_7_engtype_3D\0").is_none());
        assert!(find_instance(7, b"pid_7_engtype_3D\0pid_8_eng").is_none());
    }

    #[test]
    fn test_bytes_after_terminator_are_ignored() {
        let buf = b"pid_8_engtype_3D\0\0pid_7_engtype_3D\0\0";
        assert!(find_instance(7, buf).is_none());
        assert!(find_instance(8, buf).is_some());
    }

    #[test]
    fn test_builder_rejects_bad_names() {
        let mut builder = MultiStringBuilder::new();
        assert!(!builder.push(""));
        assert!(!builder.push("a\0b"));
        assert!(builder.push("pid_1_engtype_3D"));
        assert_eq!(builder.finish(), b"pid_1_engtype_3D\0\0".to_vec());
        assert_eq!(MultiStringBuilder::new().finish(), vec![0]);
    }

    #[test]
    fn test_random_buffers_never_panic() {
        let mut rng = rand::thread_rng();
        let alphabet = b"pid_0123456789engtype3D\0";
        for _ in 0..2000 {
            let len = rng.gen_range(0..64);
            let buf: Vec<u8> = (0..len)
                .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
                .collect();
            let pid = rng.gen_range(0..100u64);
            if let Some(found) = find_instance(pid, &buf) {
                assert!(found.as_str().ends_with("engtype_3D"));
                assert!(found.as_str().contains(&format!("pid_{}", pid)));
            }
        }
    }
}
