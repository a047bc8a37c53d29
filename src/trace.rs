//! Chrome trace output, enabled with `-d trace`.  Load the resulting
//! trace.json in a chrome://tracing-compatible viewer.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Instant;

struct Span {
    name: &'static str,
    start: Instant,
    end: Instant,
}

struct Trace {
    origin: Instant,
    spans: Vec<Span>,
    w: BufWriter<File>,
}

static mut TRACE: Option<Trace> = None;

impl Trace {
    fn write(&mut self) -> std::io::Result<()> {
        writeln!(self.w, "[")?;
        for span in &self.spans {
            writeln!(
                self.w,
                "{{ \"pid\": 0, \"name\": {:?}, \"ph\": \"X\", \"ts\": {}, \"dur\": {} }},",
                span.name,
                span.start.duration_since(self.origin).as_micros(),
                span.end.duration_since(span.start).as_micros()
            )?;
        }
        writeln!(
            self.w,
            "{{ \"pid\": 0, \"name\": \"main\", \"ph\": \"X\", \"ts\": 0, \"dur\": {} }}",
            self.origin.elapsed().as_micros()
        )?;
        writeln!(self.w, "]")?;
        self.w.flush()
    }
}

/// Creates the trace file; an unwritable path fails here, before any work
/// has run.
pub fn open(path: &str) -> std::io::Result<()> {
    let w = BufWriter::new(File::create(path)?);
    // Safety: accessing global mut, not threadsafe.
    unsafe {
        TRACE = Some(Trace {
            origin: Instant::now(),
            spans: Vec::new(),
            w,
        });
    }
    Ok(())
}

#[inline]
pub fn scope<T>(name: &'static str, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let result = f();
    // Safety: accessing global mut, not threadsafe.
    unsafe {
        if let Some(trace) = &mut TRACE {
            trace.spans.push(Span {
                name,
                start,
                end: Instant::now(),
            });
        }
    }
    result
}

pub fn close() -> std::io::Result<()> {
    // Safety: accessing global mut, not threadsafe.
    unsafe {
        if let Some(trace) = &mut TRACE {
            return trace.write();
        }
    }
    Ok(())
}
