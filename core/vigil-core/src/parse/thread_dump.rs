//! Thread-state dump parser.
//!
//! A dump lists every thread of the process, innermost frame first:
//!
//! ```text
//! ----- pid 4242 at 2024-03-01 10:00:00 -----
//! Cmd line: com.example
//!
//! "main" prio=5 tid=1 Blocked
//!   | group="main" sCount=1 ucsCount=0 flags=1 obj=0x72 self=0xb4
//!   | sysTid=4242 nice=-10 cgrp=top-app sched=0/0 handle=0x7f
//!   at com.example.Worker.run(Worker.java:42)
//!   - waiting to lock <0x0abc> (a java.lang.Object) held by thread 7
//!   native: #00 pc 000000000004b0c4  /apex/.../libc.so (syscall+28)
//! ```

use std::collections::BTreeMap;

use tracing::debug;
use vigil_protocol::{DebugImage, LockKind, LockReason, StackFrame, Stacktrace, Thread};

use super::{elf_image, is_system_library, native_frame_from};
use crate::patterns::{
    RE_DUMP_BEGIN, RE_DUMP_CMD_LINE, RE_DUMP_END, RE_DUMP_NATIVE_FRAME, RE_FRAME_LOCATION,
    RE_LOCK_LINE, RE_MANAGED_FRAME, RE_THREAD_HEADER, RE_THREAD_SYS_TID,
};

pub const MAIN_THREAD_NAME: &str = "main";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ThreadDump {
    pub pid: Option<u32>,
    pub process: Option<String>,
    pub threads: Vec<Thread>,
    pub debug_images: Vec<DebugImage>,
}

impl ThreadDump {
    pub fn main_thread(&self) -> Option<&Thread> {
        self.threads.iter().find(|thread| thread.main)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ThreadDumpOutcome {
    /// No diagnostic stream, or an empty one.
    NoDump,
    /// A dump without a main thread, or whose main thread only shows OS
    /// native frames. Nothing a developer could act on.
    NoActionableData,
    /// Text was present but contained no recognizable thread.
    Unrecognized,
    Dump(ThreadDump),
}

#[derive(Default)]
struct ThreadBuilder {
    thread: Thread,
    // Innermost first, as printed.
    frames: Vec<StackFrame>,
}

impl ThreadBuilder {
    fn finish(mut self) -> Thread {
        self.frames.reverse();
        if !self.frames.is_empty() {
            self.thread.stacktrace = Some(Stacktrace {
                frames: self.frames,
            });
        }
        self.thread
    }
}

pub fn parse_thread_dump(text: &str) -> ThreadDumpOutcome {
    if text.trim().is_empty() {
        return ThreadDumpOutcome::NoDump;
    }

    let mut dump = ThreadDump::default();
    let mut current: Option<ThreadBuilder> = None;
    let mut next_synthetic_id = 1_000_000u64;

    for line in text.lines() {
        let line = line.trim_end();

        if let Some(caps) = RE_DUMP_BEGIN.captures(line) {
            dump.pid = caps[1].parse().ok();
            continue;
        }
        if let Some(caps) = RE_DUMP_CMD_LINE.captures(line) {
            dump.process = Some(caps[1].trim().to_string());
            continue;
        }
        if RE_DUMP_END.is_match(line) {
            if let Some(builder) = current.take() {
                dump.threads.push(builder.finish());
            }
            continue;
        }

        if let Some(caps) = RE_THREAD_HEADER.captures(line) {
            if let Some(builder) = current.take() {
                dump.threads.push(builder.finish());
            }
            let name = caps["name"].to_string();
            let id = caps
                .name("tid")
                .and_then(|tid| tid.as_str().parse().ok())
                .unwrap_or_else(|| {
                    next_synthetic_id += 1;
                    next_synthetic_id
                });
            let main = name == MAIN_THREAD_NAME;
            current = Some(ThreadBuilder {
                thread: Thread {
                    id,
                    state: caps.name("state").map(|m| m.as_str().to_string()),
                    name: Some(name),
                    crashed: main,
                    current: main,
                    main,
                    ..Thread::default()
                },
                frames: Vec::new(),
            });
            continue;
        }

        let Some(builder) = current.as_mut() else {
            continue;
        };

        if let Some(caps) = RE_MANAGED_FRAME.captures(line) {
            builder.frames.push(managed_frame(
                &caps["class"],
                &caps["method"],
                &caps["location"],
            ));
        } else if let Some(caps) = RE_DUMP_NATIVE_FRAME.captures(line) {
            if let (Some(path), Some(build_id)) = (caps.name("path"), caps.name("build_id")) {
                add_image(
                    &mut dump.debug_images,
                    elf_image(path.as_str(), build_id.as_str(), None),
                );
            }
            builder.frames.push(native_frame_from(&caps));
        } else if let Some(caps) = RE_LOCK_LINE.captures(line) {
            let lock = LockReason {
                kind: lock_kind(&caps["kind"]),
                address: Some(caps["addr"].to_string()),
                package_name: None,
                class_name: Some(caps["class"].to_string()),
                thread_id: caps.name("owner").and_then(|m| m.as_str().parse().ok()),
            };
            if lock.kind == LockKind::Locked {
                builder
                    .thread
                    .held_locks
                    .insert(caps["addr"].to_string(), lock.clone());
            }
            if let Some(frame) = builder.frames.last_mut() {
                frame.lock = Some(lock);
            }
        } else if builder.thread.id >= 1_000_000 {
            // Unattached threads only expose their kernel id.
            if let Some(caps) = RE_THREAD_SYS_TID.captures(line) {
                if let Ok(sys_tid) = caps[1].parse() {
                    builder.thread.id = sys_tid;
                }
            }
        }
    }

    if let Some(builder) = current.take() {
        dump.threads.push(builder.finish());
    }

    if dump.threads.is_empty() {
        debug!("Thread dump contained no recognizable threads");
        return ThreadDumpOutcome::Unrecognized;
    }

    match dump.main_thread() {
        None => {
            debug!(threads = dump.threads.len(), "Thread dump has no main thread");
            ThreadDumpOutcome::NoActionableData
        }
        Some(main) if !has_actionable_frames(main) => {
            debug!("Main thread shows only system native frames");
            ThreadDumpOutcome::NoActionableData
        }
        Some(_) => ThreadDumpOutcome::Dump(dump),
    }
}

fn managed_frame(class: &str, method: &str, location: &str) -> StackFrame {
    let (filename, lineno) = match RE_FRAME_LOCATION.captures(location) {
        Some(caps) => (Some(caps["file"].to_string()), caps["line"].parse().ok()),
        None if location == "Native method" || location.is_empty() => (None, None),
        None => (Some(location.to_string()), None),
    };
    StackFrame {
        function: Some(method.to_string()),
        module: Some(class.to_string()),
        filename,
        lineno,
        ..StackFrame::default()
    }
}

fn lock_kind(text: &str) -> LockKind {
    match text {
        "locked" => LockKind::Locked,
        "waiting on" => LockKind::Waiting,
        "sleeping on" => LockKind::Sleeping,
        _ => LockKind::Blocked,
    }
}

fn has_actionable_frames(thread: &Thread) -> bool {
    let Some(stacktrace) = &thread.stacktrace else {
        return false;
    };
    stacktrace.frames.iter().any(|frame| {
        !frame.native
            || frame
                .package
                .as_deref()
                .map(|path| !is_system_library(path))
                .unwrap_or(false)
    })
}

fn add_image(images: &mut Vec<DebugImage>, image: DebugImage) {
    if !images.iter().any(|known| known.code_file == image.code_file) {
        images.push(image);
    }
}

/// Locks held per thread, keyed by thread id, for callers rendering lock graphs.
pub fn held_locks_by_thread(dump: &ThreadDump) -> BTreeMap<u64, Vec<&LockReason>> {
    dump.threads
        .iter()
        .filter(|thread| !thread.held_locks.is_empty())
        .map(|thread| (thread.id, thread.held_locks.values().collect()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = r#"
----- pid 4242 at 2024-03-01 10:00:00 -----
Cmd line: com.example

"main" prio=5 tid=1 Blocked
  | group="main" sCount=1 ucsCount=0 flags=1 obj=0x72 self=0xb4
  | sysTid=4242 nice=-10 cgrp=top-app sched=0/0 handle=0x7f
  at com.example.Worker.run(Worker.java:42)
  - waiting to lock <0x0abc1234> (a java.lang.Object) held by thread 7
  at com.example.ui.MainActivity.onCreate(MainActivity.java:17)
  at android.app.Activity.performCreate(Native method)

"worker" prio=5 tid=7 Sleeping
  at java.lang.Thread.sleep(Native method)
  - sleeping on <0x0def> (a java.lang.Object)
  at com.example.Worker.hold(Worker.java:9)
  - locked <0x0abc1234> (a java.lang.Object)
  native: #00 pc 000000000004b0c4  /data/app/com.example/lib/arm64/libgame.so (tick+28) (BuildId: AB12)

----- end 4242 -----
"#;

    fn parse_ok(text: &str) -> ThreadDump {
        match parse_thread_dump(text) {
            ThreadDumpOutcome::Dump(dump) => dump,
            other => panic!("expected dump, got {:?}", other),
        }
    }

    #[test]
    fn parses_process_and_threads() {
        let dump = parse_ok(DUMP);
        assert_eq!(dump.pid, Some(4242));
        assert_eq!(dump.process.as_deref(), Some("com.example"));
        assert_eq!(dump.threads.len(), 2);

        let main = dump.main_thread().unwrap();
        assert_eq!(main.id, 1);
        assert!(main.crashed && main.current);
        assert_eq!(main.state.as_deref(), Some("Blocked"));
    }

    #[test]
    fn frames_are_stored_innermost_last() {
        let dump = parse_ok(DUMP);
        let frames = &dump.main_thread().unwrap().stacktrace.as_ref().unwrap().frames;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].function.as_deref(), Some("performCreate"));
        let innermost = frames.last().unwrap();
        assert_eq!(innermost.module.as_deref(), Some("com.example.Worker"));
        assert_eq!(innermost.filename.as_deref(), Some("Worker.java"));
        assert_eq!(innermost.lineno, Some(42));
        assert_eq!(innermost.lock.as_ref().unwrap().thread_id, Some(7));
    }

    #[test]
    fn locks_and_native_images_are_collected() {
        let dump = parse_ok(DUMP);
        let held = held_locks_by_thread(&dump);
        assert_eq!(held[&7].len(), 1);
        assert_eq!(dump.debug_images.len(), 1);
        assert_eq!(dump.debug_images[0].code_id.as_deref(), Some("ab12"));
    }

    #[test]
    fn empty_dump_is_no_dump() {
        assert_eq!(parse_thread_dump("  \n"), ThreadDumpOutcome::NoDump);
    }

    #[test]
    fn text_without_threads_is_unrecognized() {
        assert_eq!(
            parse_thread_dump("garbage that is not a dump"),
            ThreadDumpOutcome::Unrecognized
        );
    }

    #[test]
    fn missing_main_thread_is_not_actionable() {
        let text = "\"worker\" prio=5 tid=7 Runnable\n  at com.example.Worker.run(Worker.java:1)\n";
        assert_eq!(parse_thread_dump(text), ThreadDumpOutcome::NoActionableData);
    }

    #[test]
    fn system_only_main_thread_is_not_actionable() {
        let text = "\"main\" prio=5 tid=1 Native\n  native: #00 pc 0000000000001000  /apex/com.android.runtime/lib64/bionic/libc.so (__epoll_pwait+8)\n  native: #01 pc 0000000000002000  /system/lib64/libutils.so (android::Looper::pollOnce(int, int*, int*, void**)+60)\n";
        assert_eq!(parse_thread_dump(text), ThreadDumpOutcome::NoActionableData);
    }
}
