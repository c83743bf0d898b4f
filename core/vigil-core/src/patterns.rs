//! Compiled regex patterns for parsing OS diagnostic dumps.
//!
//! These patterns are compiled once on first use and reused by the thread
//! dump and native fault parsers.
//! Update these when the platform's dump formats change.

use once_cell::sync::Lazy;
use regex::Regex;

// ═══════════════════════════════════════════════════════════════════════════════
// Thread Dump Regexes
// ═══════════════════════════════════════════════════════════════════════════════

pub static RE_DUMP_BEGIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-{5} pid (\d+) at (.+?) -{5}$").unwrap());
pub static RE_DUMP_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-{5} end (\d+) -{5}$").unwrap());
pub static RE_DUMP_CMD_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Cmd line: (.+)$").unwrap());
pub static RE_THREAD_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^"(?P<name>.*)"(?: daemon)? prio=(?P<prio>\d+)(?: tid=(?P<tid>\d+))?\s*(?P<state>[^\s(]+)?"#)
        .unwrap()
});
pub static RE_THREAD_SYS_TID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\|.*\bsysTid=(\d+)").unwrap());
pub static RE_MANAGED_FRAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*at (?P<class>[^\s(]+)\.(?P<method>[^.\s(]+)\((?P<location>[^)]*)\)").unwrap()
});
pub static RE_FRAME_LOCATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<file>.+?):(?P<line>\d+)$").unwrap());
pub static RE_LOCK_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*- (?P<kind>locked|waiting to lock|waiting on|sleeping on) <(?P<addr>0x[0-9a-fA-F]+)> \(a (?P<class>[^)]+)\)(?: held by thread (?P<owner>\d+))?",
    )
    .unwrap()
});
pub static RE_DUMP_NATIVE_FRAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*native: #(?P<index>\d+) pc (?P<pc>[0-9a-fA-F]+)\s+(?P<path>\S+)(?:\s+\((?P<symbol>[^()]*(?:\([^()]*\))?[^()]*?)\+(?P<offset>\d+)\))?(?:\s+\(BuildId: (?P<build_id>[0-9a-fA-F]+)\))?",
    )
    .unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════════
// Native Fault Trace Regexes
// ═══════════════════════════════════════════════════════════════════════════════

pub static RE_TOMBSTONE_ABI: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ABI: '(\w+)'").unwrap());
pub static RE_TOMBSTONE_PROCESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^pid: (?P<pid>\d+), tid: (?P<tid>\d+), name: (?P<thread>.+?)\s+>>> (?P<process>.+?) <<<")
        .unwrap()
});
pub static RE_TOMBSTONE_SIGNAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^signal (?P<number>\d+) \((?P<name>\w+)\), code (?P<code>-?\d+) \((?P<code_name>[^)]*)\)(?:, fault addr (?P<addr>\S+))?",
    )
    .unwrap()
});
pub static RE_TOMBSTONE_CAUSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Cause: (.+)$").unwrap());
pub static RE_TOMBSTONE_ABORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Abort message: '(.*)'$").unwrap());
pub static RE_TOMBSTONE_FRAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*#(?P<index>\d+) pc (?P<pc>[0-9a-fA-F]+)\s+(?P<path>\S+)(?:\s+\((?P<symbol>[^()]*(?:\([^()]*\))?[^()]*?)\+(?P<offset>\d+)\))?(?:\s+\(BuildId: (?P<build_id>[0-9a-fA-F]+)\))?",
    )
    .unwrap()
});
pub static RE_TOMBSTONE_MAP_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?:--->)?(?P<start>[0-9a-fA-F']+)-(?P<end>[0-9a-fA-F']+)\s+(?P<perms>[rwxps-]{3,4})\s+\S+\s+\S+\s+(?P<path>/\S+)(?:.*?\(BuildId: (?P<build_id>[0-9a-fA-F]+)\))?",
    )
    .unwrap()
});
pub static RE_TOMBSTONE_THREAD_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:--- ){3,}---\s*$").unwrap());

// ═══════════════════════════════════════════════════════════════════════════════
// Release Parsing
// ═══════════════════════════════════════════════════════════════════════════════

pub static RE_NUMERIC_BUILD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").unwrap());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_header_captures_name_tid_and_state() {
        let caps = RE_THREAD_HEADER
            .captures(r#""main" prio=5 tid=1 Blocked"#)
            .unwrap();
        assert_eq!(&caps["name"], "main");
        assert_eq!(&caps["tid"], "1");
        assert_eq!(&caps["state"], "Blocked");

        let daemon = RE_THREAD_HEADER
            .captures(r#""Signal Catcher" daemon prio=10 tid=4 Runnable"#)
            .unwrap();
        assert_eq!(&daemon["name"], "Signal Catcher");
    }

    #[test]
    fn managed_frame_splits_class_method_and_location() {
        let caps = RE_MANAGED_FRAME
            .captures("  at com.example.ui.MainActivity.onCreate(MainActivity.java:42)")
            .unwrap();
        assert_eq!(&caps["class"], "com.example.ui.MainActivity");
        assert_eq!(&caps["method"], "onCreate");
        assert_eq!(&caps["location"], "MainActivity.java:42");
    }

    #[test]
    fn native_frame_handles_signatures_in_symbol() {
        let caps = RE_TOMBSTONE_FRAME
            .captures("      #01 pc 00000000000b1cd8  /apex/com.android.runtime/lib64/bionic/libc.so (__pthread_start(void*)+40) (BuildId: 01ab)")
            .unwrap();
        assert_eq!(&caps["symbol"], "__pthread_start(void*)");
        assert_eq!(&caps["offset"], "40");
        assert_eq!(&caps["build_id"], "01ab");
    }

    #[test]
    fn native_frame_without_symbol_keeps_build_id() {
        let caps = RE_DUMP_NATIVE_FRAME
            .captures("  native: #00 pc 000000000004b0c4  /system/lib64/libart.so (BuildId: ff00)")
            .unwrap();
        assert!(caps.name("symbol").is_none());
        assert_eq!(&caps["build_id"], "ff00");
    }

    #[test]
    fn signal_line_captures_fault_address() {
        let caps = RE_TOMBSTONE_SIGNAL
            .captures("signal 11 (SIGSEGV), code 1 (SEGV_MAPERR), fault addr 0x0000000000000000")
            .unwrap();
        assert_eq!(&caps["name"], "SIGSEGV");
        assert_eq!(&caps["code_name"], "SEGV_MAPERR");
        assert_eq!(&caps["addr"], "0x0000000000000000");
    }
}
