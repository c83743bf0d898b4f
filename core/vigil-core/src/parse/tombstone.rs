//! Native fault trace (tombstone) parser.
//!
//! Only the sections needed to rebuild an exception are read: the process
//! line, the signal line, the crashing thread's backtrace, additional thread
//! backtraces and the executable mappings of the memory map.

use std::collections::BTreeMap;

use serde_json::json;
use vigil_protocol::{DebugImage, Exception, Mechanism, StackFrame, Stacktrace, Thread};

use super::{elf_image, native_frame_from};
use crate::patterns::{
    RE_TOMBSTONE_ABI, RE_TOMBSTONE_ABORT, RE_TOMBSTONE_CAUSE, RE_TOMBSTONE_FRAME,
    RE_TOMBSTONE_MAP_LINE, RE_TOMBSTONE_PROCESS, RE_TOMBSTONE_SIGNAL,
    RE_TOMBSTONE_THREAD_SEPARATOR,
};

pub const SIGNAL_MECHANISM: &str = "signalhandler";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalInfo {
    pub number: u32,
    pub name: String,
    pub code: i32,
    pub code_name: String,
    pub fault_addr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tombstone {
    pub pid: Option<u32>,
    pub tid: Option<u64>,
    pub thread_name: Option<String>,
    pub process_name: Option<String>,
    pub abi: Option<String>,
    pub signal: Option<SignalInfo>,
    pub cause: Option<String>,
    pub abort_message: Option<String>,
    /// The crashing thread first.
    pub threads: Vec<Thread>,
    pub debug_images: Vec<DebugImage>,
}

#[derive(PartialEq)]
enum Section {
    Header,
    Backtrace,
    MemoryMap,
    Other,
}

/// Parses a tombstone. Returns `None` when the text has no process line and
/// no frames.
pub fn parse_tombstone(text: &str) -> Option<Tombstone> {
    let mut tombstone = Tombstone::default();
    let mut section = Section::Header;
    let mut frames: Vec<StackFrame> = Vec::new();
    let mut current: Option<Thread> = None;

    for line in text.lines() {
        let trimmed = line.trim();

        if RE_TOMBSTONE_THREAD_SEPARATOR.is_match(trimmed) {
            flush_thread(&mut tombstone, &mut current, &mut frames);
            section = Section::Header;
            continue;
        }
        if trimmed == "backtrace:" {
            section = Section::Backtrace;
            continue;
        }
        if trimmed.starts_with("memory map") {
            flush_thread(&mut tombstone, &mut current, &mut frames);
            section = Section::MemoryMap;
            continue;
        }

        if let Some(caps) = RE_TOMBSTONE_PROCESS.captures(trimmed) {
            flush_thread(&mut tombstone, &mut current, &mut frames);
            let tid: Option<u64> = caps["tid"].parse().ok();
            let thread_name = caps["thread"].to_string();
            let first = tombstone.threads.is_empty() && tombstone.tid.is_none();
            if first {
                tombstone.pid = caps["pid"].parse().ok();
                tombstone.tid = tid;
                tombstone.thread_name = Some(thread_name.clone());
                tombstone.process_name = Some(caps["process"].to_string());
            }
            current = Some(Thread {
                id: tid.unwrap_or_default(),
                name: Some(thread_name),
                crashed: first,
                current: first,
                main: tid.is_some() && tid == tombstone.pid.map(u64::from),
                ..Thread::default()
            });
            section = Section::Header;
            continue;
        }

        match section {
            Section::Header => {
                if let Some(caps) = RE_TOMBSTONE_ABI.captures(trimmed) {
                    tombstone.abi = Some(caps[1].to_string());
                } else if let Some(caps) = RE_TOMBSTONE_SIGNAL.captures(trimmed) {
                    if tombstone.signal.is_none() {
                        tombstone.signal = Some(SignalInfo {
                            number: caps["number"].parse().unwrap_or_default(),
                            name: caps["name"].to_string(),
                            code: caps["code"].parse().unwrap_or_default(),
                            code_name: caps["code_name"].to_string(),
                            fault_addr: caps.name("addr").map(|m| m.as_str().to_string()),
                        });
                    }
                } else if let Some(caps) = RE_TOMBSTONE_CAUSE.captures(trimmed) {
                    tombstone.cause.get_or_insert_with(|| caps[1].to_string());
                } else if let Some(caps) = RE_TOMBSTONE_ABORT.captures(trimmed) {
                    tombstone.abort_message.get_or_insert_with(|| caps[1].to_string());
                }
            }
            Section::Backtrace => {
                if let Some(caps) = RE_TOMBSTONE_FRAME.captures(line) {
                    if let (Some(path), Some(build_id)) = (caps.name("path"), caps.name("build_id"))
                    {
                        add_image(
                            &mut tombstone.debug_images,
                            elf_image(path.as_str(), build_id.as_str(), None),
                        );
                    }
                    frames.push(native_frame_from(&caps));
                } else if trimmed.is_empty() {
                    section = Section::Other;
                }
            }
            Section::MemoryMap => {
                if let Some(caps) = RE_TOMBSTONE_MAP_LINE.captures(line) {
                    if !caps["perms"].contains('x') {
                        continue;
                    }
                    let start = caps["start"].replace('\'', "");
                    let image = DebugImage {
                        ty: "elf".to_string(),
                        code_file: Some(caps["path"].to_string()),
                        code_id: caps.name("build_id").map(|m| m.as_str().to_lowercase()),
                        image_addr: Some(format!("0x{}", start.trim_start_matches('0'))),
                        ..DebugImage::default()
                    };
                    merge_mapped_image(&mut tombstone.debug_images, image);
                }
            }
            Section::Other => {}
        }
    }

    flush_thread(&mut tombstone, &mut current, &mut frames);

    if tombstone.pid.is_none() && tombstone.threads.iter().all(|t| t.stacktrace.is_none()) {
        return None;
    }
    Some(tombstone)
}

fn flush_thread(
    tombstone: &mut Tombstone,
    current: &mut Option<Thread>,
    frames: &mut Vec<StackFrame>,
) {
    // Frames printed before any process line belong to an anonymous crashing thread.
    let thread = match current.take() {
        Some(thread) => Some(thread),
        None if !frames.is_empty() => Some(Thread {
            crashed: true,
            current: true,
            ..Thread::default()
        }),
        None => None,
    };
    if let Some(mut thread) = thread {
        if !frames.is_empty() {
            let mut ordered = std::mem::take(frames);
            ordered.reverse();
            thread.stacktrace = Some(Stacktrace { frames: ordered });
        }
        tombstone.threads.push(thread);
    }
}

fn add_image(images: &mut Vec<DebugImage>, image: DebugImage) {
    if !images.iter().any(|known| known.code_file == image.code_file) {
        images.push(image);
    }
}

/// Memory map entries carry load addresses; backtrace-derived images do not.
fn merge_mapped_image(images: &mut Vec<DebugImage>, image: DebugImage) {
    match images
        .iter_mut()
        .find(|known| known.code_file == image.code_file)
    {
        Some(known) => {
            if known.image_addr.is_none() {
                known.image_addr = image.image_addr;
            }
            if known.code_id.is_none() {
                known.code_id = image.code_id;
            }
        }
        None => images.push(image),
    }
}

impl Tombstone {
    pub fn crashed_thread(&self) -> Option<&Thread> {
        self.threads.iter().find(|thread| thread.crashed)
    }

    pub fn exception(&self) -> Exception {
        let signal = self.signal.as_ref();
        let ty = signal
            .map(|signal| signal.name.clone())
            .unwrap_or_else(|| "NativeFault".to_string());

        let value = self
            .abort_message
            .clone()
            .or_else(|| self.cause.clone())
            .or_else(|| {
                signal.map(|signal| match &signal.fault_addr {
                    Some(addr) => format!(
                        "Fatal signal {} ({}), code {} ({}), fault addr {}",
                        signal.number, signal.name, signal.code, signal.code_name, addr
                    ),
                    None => format!(
                        "Fatal signal {} ({}), code {} ({})",
                        signal.number, signal.name, signal.code, signal.code_name
                    ),
                })
            });

        let mut data = BTreeMap::new();
        if let Some(signal) = signal {
            data.insert(
                "signal".to_string(),
                json!({
                    "number": signal.number,
                    "name": signal.name,
                    "code": signal.code,
                    "code_name": signal.code_name,
                }),
            );
            if let Some(addr) = &signal.fault_addr {
                data.insert("fault_addr".to_string(), json!(addr));
            }
        }

        let crashed = self.crashed_thread();
        Exception {
            ty,
            value,
            module: None,
            thread_id: crashed.map(|thread| thread.id),
            stacktrace: crashed.and_then(|thread| thread.stacktrace.clone()),
            mechanism: Some(Mechanism {
                ty: SIGNAL_MECHANISM.to_string(),
                description: None,
                handled: Some(false),
                synthetic: None,
                data,
            }),
        }
    }
}
