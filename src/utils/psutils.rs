use std::path::Path;
use sysinfo::{Pid, Process, System};
use users::{Users, UsersCache};

pub fn resolve_username(uid: u32, users_cache: &UsersCache) -> String {
    users_cache
        .get_user_by_uid(uid)
        .map(|user| user.name().to_string_lossy().to_string())
        .unwrap_or_else(|| uid.to_string())
}

/// File name of an executable path, e.g. `/usr/bin/firefox` -> `firefox`.
pub fn last_path_item(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.is_empty())
}

/// Name shown for a process: its executable file name, or the kernel
/// reported name when the executable is not visible to us.
pub fn display_name(process: &Process) -> String {
    process
        .exe()
        .and_then(last_path_item)
        .unwrap_or_else(|| process.name().to_string_lossy().to_string())
}

pub fn process_owner(process: &Process, users_cache: &UsersCache) -> Option<String> {
    process
        .user_id()
        .map(|uid| resolve_username(**uid, users_cache))
}

/// Process with the highest CPU usage since the previous refresh. Threads are
/// ignored so that a busy thread maps to nothing rather than a fake pid.
pub fn busiest_process(system: &System) -> Option<Pid> {
    system
        .processes()
        .iter()
        .filter(|(_, process)| process.thread_kind().is_none())
        .max_by(|(_, a), (_, b)| a.cpu_usage().total_cmp(&b.cpu_usage()))
        .map(|(pid, _)| *pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sysinfo::ProcessesToUpdate;

    #[test]
    fn test_last_path_item() {
        assert_eq!(
            last_path_item(Path::new("/usr/lib/firefox/firefox")),
            Some("firefox".to_string())
        );
        assert_eq!(last_path_item(Path::new("cargo")), Some("cargo".to_string()));
        assert_eq!(last_path_item(Path::new("/")), None);
    }

    #[test]
    fn test_resolve_unknown_uid_falls_back_to_number() {
        let users_cache = UsersCache::new();
        assert_eq!(resolve_username(4_000_000_123, &users_cache), "4000000123");
    }

    #[test]
    fn test_own_process_has_a_name() {
        let mut system = System::new();
        let pid = sysinfo::get_current_pid().unwrap();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let process = system.process(pid).unwrap();
        assert!(!display_name(process).is_empty());
    }

    #[test]
    fn test_busiest_process_exists() {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let pid = busiest_process(&system).unwrap();
        assert!(system.process(pid).is_some());
    }
}
