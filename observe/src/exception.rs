/*
   Polar (OSS)

   Copyright 2024 Carnegie Mellon University.

   NO WARRANTY. THIS CARNEGIE MELLON UNIVERSITY AND SOFTWARE ENGINEERING INSTITUTE MATERIAL IS
   FURNISHED ON AN "AS-IS" BASIS. CARNEGIE MELLON UNIVERSITY MAKES NO WARRANTIES OF ANY KIND,
   EITHER EXPRESSED OR IMPLIED, AS TO ANY MATTER INCLUDING, BUT NOT LIMITED TO, WARRANTY OF FITNESS
   FOR PURPOSE OR MERCHANTABILITY, EXCLUSIVITY, OR RESULTS OBTAINED FROM USE OF THE MATERIAL.
   CARNEGIE MELLON UNIVERSITY DOES NOT MAKE ANY WARRANTY OF ANY KIND WITH RESPECT TO FREEDOM FROM
   PATENT, TRADEMARK, OR COPYRIGHT INFRINGEMENT.

   Licensed under a MIT-style license, please see license.txt or contact permission@sei.cmu.edu for
   full terms.

   [DISTRIBUTION STATEMENT A] This material has been approved for public release and unlimited
   distribution.  Please see Copyright notice for non-US Government use and distribution.

   This Software includes and/or makes use of Third-Party Software each subject to its own license.

   DM24-0470
*/

//! Exception snapshots, and the terminal response returned when a handler fails.
//!
//! Snapshots are only taken when the producer is connected to a monitor. Without a channel
//! there is nobody to show them to, so [`capture_exception`] skips the backtrace and binding
//! capture entirely and returns a minimal descriptor.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::Debug;
use std::panic::Location;
use std::sync::Once;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use vigil::mask::safe_repr;
use vigil::{Config, Event, ExceptionInfo, StackFrame, MASK_SENTINEL};

use crate::context::{self, RequestContext};
use crate::Monitor;

/// Detail shown to clients when exception details are disabled.
pub const GENERIC_DETAIL: &str = "An internal error occurred. Please try again later.";
/// Bindings kept per frame.
pub const MAX_LOCALS_PER_FRAME: usize = 10;
/// Exception type reported for panics.
pub const PANIC_TYPE: &str = "panic";

const UNKNOWN_FILE: &str = "<unknown>";

/// Frames belonging to backtrace capture and panic dispatch, stripped from the top of
/// every trace.
const INTERNAL_FRAME_PREFIXES: [&str; 9] = [
    "std::backtrace",
    "std::panicking",
    "std::panic::",
    "std::sys",
    "core::panicking",
    "rust_begin_unwind",
    "__rust",
    "<alloc::boxed::Box<",
    "vigil_observe::exception",
];

/// Where a failure originated.
struct Site {
    file: String,
    line: u32,
    backtrace: String,
}

impl Site {
    fn here(location: &Location<'_>) -> Self {
        Site {
            file: location.file().to_string(),
            line: location.line(),
            backtrace: Backtrace::force_capture().to_string(),
        }
    }
}

thread_local! {
    static LAST_PANIC: RefCell<Option<Site>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Records the location and backtrace of panics raised inside captured requests, so the
/// snapshot points at the panic site rather than at the code that caught it. Panics outside
/// a request go to the previously installed hook.
pub(crate) fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if context::current().is_none() {
                previous(info);
                return;
            }
            let site = match info.location() {
                Some(location) => Site::here(location),
                None => Site {
                    file: UNKNOWN_FILE.to_string(),
                    line: 0,
                    backtrace: Backtrace::force_capture().to_string(),
                },
            };
            LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(site));
        }));
    });
}

/// Captures `error` together with the named bindings in `locals`.
///
/// Inside a captured request the snapshot is correlated with it, published when exception
/// capture is enabled, and carried by the request's completion. The bindings are attached to
/// the frame of the caller.
#[track_caller]
pub fn capture_exception<E>(error: &E, locals: &[(&str, &dyn Debug)]) -> ExceptionInfo
where
    E: Error + ?Sized,
{
    let location = Location::caller();
    let exception_type = short_type_name(std::any::type_name::<E>());
    let Some(ctx) = context::current() else {
        return ExceptionInfo::new(exception_type, error.to_string());
    };
    let monitor = ctx.monitor().clone();
    snapshot(
        &monitor,
        Some(&*ctx),
        exception_type,
        error.to_string(),
        Site::here(location),
        locals,
    )
}

impl Monitor {
    /// Same as [`capture_exception`], for code that runs outside any request.
    #[track_caller]
    pub fn capture_exception<E>(&self, error: &E, locals: &[(&str, &dyn Debug)]) -> ExceptionInfo
    where
        E: Error + ?Sized,
    {
        let location = Location::caller();
        let exception_type = short_type_name(std::any::type_name::<E>());
        if !self.is_enabled() {
            return ExceptionInfo::new(exception_type, error.to_string());
        }
        let ctx = context::current();
        snapshot(
            self,
            ctx.as_deref(),
            exception_type,
            error.to_string(),
            Site::here(location),
            locals,
        )
    }
}

/// Snapshot of a panic payload caught by the capture middleware.
pub(crate) fn capture_panic(payload: &(dyn Any + Send)) -> ExceptionInfo {
    let message = panic_message(payload);
    let Some(ctx) = context::current() else {
        return ExceptionInfo::new(PANIC_TYPE, message);
    };
    let site = LAST_PANIC
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| Site::here(Location::caller()));
    let monitor = ctx.monitor().clone();
    snapshot(&monitor, Some(&*ctx), PANIC_TYPE.to_string(), message, site, &[])
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

fn snapshot(
    monitor: &Monitor,
    ctx: Option<&RequestContext>,
    exception_type: String,
    message: String,
    site: Site,
    locals: &[(&str, &dyn Debug)],
) -> ExceptionInfo {
    let config = monitor.config();
    let mut info = ExceptionInfo::new(exception_type, message);
    info.frames = frames_with_locals(
        parse_backtrace(&site.backtrace),
        &site,
        locals_preview(config, locals),
    );
    info.traceback = format_traceback(&info);
    if let Some(ctx) = ctx {
        info.request_id = Some(ctx.request_id().to_string());
        info.endpoint = Some(ctx.endpoint().to_string());
        info.method = Some(ctx.method().to_string());
    }

    if config.enable_exceptions {
        if let Some(client) = monitor.client() {
            client.send(&Event::Exception(info.clone()));
        }
        if let Some(ctx) = ctx {
            ctx.push_exception(info.clone());
        }
    }
    info
}

/// Redacted previews of caller-supplied bindings. Names starting with `_` are skipped.
pub fn locals_preview(config: &Config, locals: &[(&str, &dyn Debug)]) -> BTreeMap<String, String> {
    locals
        .iter()
        .filter(|(name, _)| !name.starts_with('_'))
        .take(MAX_LOCALS_PER_FRAME)
        .map(|(name, value)| {
            let preview = if config.is_masked(name) {
                MASK_SENTINEL.to_string()
            } else {
                safe_repr(*value)
            };
            (name.to_string(), preview)
        })
        .collect()
}

/// Parses the display form of a [`Backtrace`] into frames, innermost first, dropping the
/// capture machinery at the top.
pub fn parse_backtrace(text: &str) -> Vec<StackFrame> {
    let mut frames: Vec<StackFrame> = Vec::new();
    for line in text.lines() {
        let line = line.trim_start();
        if let Some(location) = line.strip_prefix("at ") {
            if let Some(frame) = frames.last_mut() {
                let (file, lineno) = split_location(location);
                frame.filename = file;
                frame.lineno = lineno;
            }
            continue;
        }
        let Some((index, function)) = line.split_once(": ") else {
            continue;
        };
        if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        frames.push(StackFrame {
            filename: UNKNOWN_FILE.to_string(),
            function: strip_hash(function.trim()).to_string(),
            lineno: 0,
            locals_preview: BTreeMap::new(),
        });
    }

    let internal = frames
        .iter()
        .take_while(|frame| {
            INTERNAL_FRAME_PREFIXES
                .iter()
                .any(|prefix| frame.function.starts_with(prefix))
        })
        .count();
    frames.split_off(internal)
}

fn split_location(location: &str) -> (String, u32) {
    let mut parts = location.trim().rsplitn(3, ':');
    let column = parts.next();
    let line = parts.next().and_then(|l| l.parse().ok());
    match (parts.next(), line) {
        (Some(file), Some(line)) => (file.to_string(), line),
        _ => (column.unwrap_or(UNKNOWN_FILE).to_string(), 0),
    }
}

/// Drops the `::h0123456789abcdef` disambiguator some symbol formats carry.
fn strip_hash(function: &str) -> &str {
    match function.rsplit_once("::h") {
        Some((name, hash)) if hash.len() == 16 && hash.chars().all(|c| c.is_ascii_hexdigit()) => name,
        _ => function,
    }
}

/// Attaches `locals` to the frame at the capture site, inserting one when the trace has no
/// matching frame (e.g. builds without debug info).
fn frames_with_locals(
    mut frames: Vec<StackFrame>,
    site: &Site,
    locals: BTreeMap<String, String>,
) -> Vec<StackFrame> {
    let position = frames
        .iter()
        .position(|frame| frame.lineno == site.line && frame.filename.ends_with(&site.file));
    match position {
        Some(index) => frames[index].locals_preview = locals,
        None => frames.insert(
            0,
            StackFrame {
                filename: site.file.clone(),
                function: UNKNOWN_FILE.to_string(),
                lineno: site.line,
                locals_preview: locals,
            },
        ),
    }
    frames
}

fn format_traceback(info: &ExceptionInfo) -> String {
    let mut traceback = format!("{}: {}", info.exception_type, info.message);
    for (depth, frame) in info.frames.iter().enumerate() {
        traceback.push_str(&format!(
            "\n  {depth}: {}\n        at {}:{}",
            frame.function, frame.filename, frame.lineno
        ));
    }
    traceback
}

/// `std::io::error::Error` becomes `Error`, `dyn my::Trait` becomes `Trait`.
pub fn short_type_name(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    let base = base.trim_start_matches("dyn ").trim();
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// The terminal response sent instead of a failed handler's: status 500 with a JSON body.
/// The traceback is only exposed when exception details are enabled.
pub fn error_response(info: &ExceptionInfo, config: &Config) -> Response {
    let body = if config.enable_exceptions {
        json!({
            "error": "Internal Server Error",
            "detail": info.message,
            "exception_type": info.exception_type,
            "traceback": info.traceback,
        })
    } else {
        json!({
            "error": "Internal Server Error",
            "detail": GENERIC_DETAIL,
            "exception_type": info.exception_type,
        })
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    const SAMPLE: &str = "   0: std::backtrace_rs::backtrace::libunwind::trace
             at /rustc/abc/library/std/src/../../backtrace/src/backtrace/libunwind.rs:116:5
   1: std::backtrace::Backtrace::force_capture
             at /rustc/abc/library/std/src/backtrace.rs:312:9
   2: vigil_observe::exception::Site::here
             at ./observe/src/exception.rs:60:24
   3: my_service::handlers::load_item::h0123456789abcdef
             at ./src/handlers.rs:42:17
   4: my_service::main
   5: core::ops::function::FnOnce::call_once
             at /rustc/abc/library/core/src/ops/function.rs:250:5";

    #[derive(Debug)]
    struct NotFound;

    impl fmt::Display for NotFound {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "item not found")
        }
    }

    impl Error for NotFound {}

    #[test]
    fn backtrace_text_becomes_frames() {
        let frames = parse_backtrace(SAMPLE);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].function, "my_service::handlers::load_item");
        assert_eq!(frames[0].filename, "./src/handlers.rs");
        assert_eq!(frames[0].lineno, 42);
        assert_eq!(frames[1].filename, UNKNOWN_FILE);
        assert_eq!(frames[2].lineno, 250);
    }

    #[test]
    fn locals_attach_to_the_capture_site() {
        let site = Site {
            file: "src/handlers.rs".to_string(),
            line: 42,
            backtrace: SAMPLE.to_string(),
        };
        let locals = BTreeMap::from([("item_id".to_string(), "7".to_string())]);
        let frames = frames_with_locals(parse_backtrace(&site.backtrace), &site, locals);
        assert_eq!(frames[0].locals_preview["item_id"], "7");
        assert!(frames[1].locals_preview.is_empty());

        let elsewhere = Site {
            file: "src/other.rs".to_string(),
            line: 3,
            backtrace: SAMPLE.to_string(),
        };
        let frames = frames_with_locals(parse_backtrace(SAMPLE), &elsewhere, BTreeMap::new());
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].filename, "src/other.rs");
    }

    #[test]
    fn locals_are_masked_filtered_and_bounded() {
        let config = Config::default();
        let password = "hunter2";
        let hidden = 1;
        let long = "z".repeat(300);
        let mut locals: Vec<(&str, &dyn Debug)> =
            vec![("password", &password), ("_hidden", &hidden), ("long", &long)];
        let names: Vec<String> = (0..20).map(|i| format!("v{i:02}")).collect();
        for name in &names {
            locals.push((name.as_str(), &hidden));
        }

        let preview = locals_preview(&config, &locals);
        assert_eq!(preview.len(), MAX_LOCALS_PER_FRAME);
        assert_eq!(preview["password"], MASK_SENTINEL);
        assert!(!preview.contains_key("_hidden"));
        assert_eq!(preview["long"].chars().count(), vigil::mask::MAX_REPR_LEN);
    }

    #[test]
    fn without_a_monitor_capture_is_minimal() {
        let id = 7;
        let locals: [(&str, &dyn Debug); 1] = [("id", &id)];
        let info = capture_exception(&NotFound, &locals);
        assert_eq!(info.exception_type, "NotFound");
        assert_eq!(info.message, "item not found");
        assert!(info.frames.is_empty());
        assert!(info.request_id.is_none());
    }

    #[test]
    fn type_names_are_shortened() {
        assert_eq!(short_type_name("std::io::error::Error"), "Error");
        assert_eq!(short_type_name("dyn core::error::Error"), "Error");
        assert_eq!(short_type_name("my::Wrapper<alloc::string::String>"), "Wrapper");
    }

    #[test]
    fn error_response_hides_details_when_disabled() {
        let info = ExceptionInfo::new("panic", "boom");
        let config = Config {
            enable_exceptions: false,
            ..Config::default()
        };
        let response = error_response(&info, &config);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
