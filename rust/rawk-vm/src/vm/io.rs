//! Input records, output redirection, and subprocess streams.

use super::*;
use crate::vm::fields::RecordSep;
use std::collections::hash_map::Entry;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::JoinHandle;
use tracing::{debug, warn};

const CHUNK_SIZE: usize = 64 * 1024;

// ── Record reader ───────────────────────────────────────────────────

/// Splits a byte stream into records according to RS. Input is decoded as
/// UTF-8; invalid sequences become U+FFFD.
pub struct RecordReader {
    input: Box<dyn Read>,
    buf: String,
    pos: usize,
    /// Bytes of a character split across reads
    pending: Vec<u8>,
    eof: bool,
}

impl RecordReader {
    pub fn new(input: Box<dyn Read>) -> Self {
        Self {
            input,
            buf: String::new(),
            pos: 0,
            pending: Vec::new(),
            eof: false,
        }
    }

    /// Read more input into the buffer. Returns false at end of input.
    fn fill(&mut self) -> io::Result<bool> {
        if self.eof {
            return Ok(false);
        }
        if self.pos > 0 && self.pos * 2 >= self.buf.len() {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let n = loop {
            match self.input.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        if n == 0 {
            self.eof = true;
            if !self.pending.is_empty() {
                self.buf.push_str(&String::from_utf8_lossy(&self.pending));
                self.pending.clear();
            }
            return Ok(false);
        }
        self.pending.extend_from_slice(&chunk[..n]);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                self.buf.push_str(text);
                self.pending.clear();
            }
            Err(e) if e.error_len().is_none() => {
                // Incomplete trailing character; keep it for the next read
                let valid = e.valid_up_to();
                self.buf
                    .push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                self.pending.drain(..valid);
            }
            Err(_) => {
                self.buf.push_str(&String::from_utf8_lossy(&self.pending));
                self.pending.clear();
            }
        }
        Ok(true)
    }

    /// Next record and the text that terminated it (RT).
    pub fn read_record(&mut self, sep: &RecordSep) -> io::Result<Option<(String, String)>> {
        match sep {
            RecordSep::Char(c) => self.read_until_char(*c),
            RecordSep::Paragraph => self.read_paragraph(),
            RecordSep::Regex(re) => self.read_until_regex(re),
        }
    }

    fn take(&mut self, len: usize, terminator_len: usize) -> (String, String) {
        let start = self.pos;
        let end = start + len;
        let record = self.buf[start..end].to_string();
        let rt = self.buf[end..end + terminator_len].to_string();
        self.pos = end + terminator_len;
        (record, rt)
    }

    fn take_rest(&mut self) -> Option<(String, String)> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let len = self.buf.len() - self.pos;
        Some(self.take(len, 0))
    }

    fn read_until_char(&mut self, c: char) -> io::Result<Option<(String, String)>> {
        let mut searched = 0;
        loop {
            if let Some(i) = self.buf[self.pos + searched..].find(c) {
                return Ok(Some(self.take(searched + i, c.len_utf8())));
            }
            searched = self.buf.len() - self.pos;
            if !self.fill()? {
                return Ok(self.take_rest());
            }
        }
    }

    fn read_paragraph(&mut self) -> io::Result<Option<(String, String)>> {
        // Skip leading newlines
        loop {
            let skipped = self.buf[self.pos..]
                .find(|c: char| c != '\n')
                .unwrap_or(self.buf.len() - self.pos);
            self.pos += skipped;
            if self.pos < self.buf.len() || !self.fill()? {
                break;
            }
        }
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        loop {
            if let Some(i) = self.buf[self.pos..].find("\n\n") {
                let run_start = self.pos + i;
                let run_len = self.buf[run_start..]
                    .find(|c: char| c != '\n')
                    .unwrap_or(self.buf.len() - run_start);
                // The run of newlines may continue past the buffer
                if run_start + run_len == self.buf.len() && self.fill()? {
                    continue;
                }
                return Ok(Some(self.take(i, run_len)));
            }
            if !self.fill()? {
                let rest = &self.buf[self.pos..];
                let len = rest.trim_end_matches('\n').len();
                let trailing = rest.len() - len;
                return Ok(Some(self.take(len, trailing)));
            }
        }
    }

    fn read_until_regex(&mut self, re: &regex::Regex) -> io::Result<Option<(String, String)>> {
        loop {
            let found = re
                .find_iter(&self.buf[self.pos..])
                .find(|m| m.start() < m.end())
                .map(|m| (m.start(), m.end()));
            match found {
                // A match touching the end of the buffer might extend further
                Some((_, end)) if self.pos + end == self.buf.len() && !self.eof => {
                    self.fill()?;
                }
                Some((start, end)) => return Ok(Some(self.take(start, end - start))),
                None => {
                    if !self.fill()? {
                        return Ok(self.take_rest());
                    }
                }
            }
        }
    }
}

// ── Output sinks and streams ────────────────────────────────────────

/// Destination of unredirected output.
pub(crate) enum Sink {
    Stdout(BufWriter<io::Stdout>),
    Writer(Box<dyn Write>),
    Captured(Vec<u8>),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Stdout(w) => w.write(buf),
            Sink::Writer(w) => w.write(buf),
            Sink::Captured(v) => v.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Stdout(w) => w.flush(),
            Sink::Writer(w) => w.flush(),
            Sink::Captured(_) => Ok(()),
        }
    }
}

pub(crate) enum OutputStream {
    File(BufWriter<File>),
    Stderr,
    /// `print | "cmd"`: the command's stdout is collected by a reader
    /// thread and copied into the VM output when the pipe is closed
    Pipe {
        child: Child,
        stdin: Option<BufWriter<ChildStdin>>,
        reader: Option<JoinHandle<io::Result<Vec<u8>>>>,
    },
}

impl Write for OutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputStream::File(w) => w.write(buf),
            OutputStream::Stderr => io::stderr().write(buf),
            OutputStream::Pipe { stdin, .. } => match stdin {
                Some(w) => w.write(buf),
                None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
            },
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputStream::File(w) => w.flush(),
            OutputStream::Stderr => io::stderr().flush(),
            OutputStream::Pipe { stdin, .. } => match stdin {
                Some(w) => w.flush(),
                None => Ok(()),
            },
        }
    }
}

pub(crate) struct InputStream {
    reader: RecordReader,
    child: Option<Child>,
}

/// Main input position plus every redirected stream, keyed by name.
#[derive(Default)]
pub(crate) struct IoState {
    pub(crate) stdin: Option<Box<dyn Read>>,
    pub(crate) main: Option<RecordReader>,
    /// Next ARGV index to examine
    pub(crate) next_arg: usize,
    /// Whether a file operand (or stdin by default) has been opened
    pub(crate) opened_operand: bool,
    pub(crate) outputs: HashMap<String, OutputStream>,
    pub(crate) inputs: HashMap<String, InputStream>,
}

fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

fn exit_code(status: std::process::ExitStatus) -> f64 {
    status.code().map(f64::from).unwrap_or(-1.0)
}

fn io_error(context: &str, e: io::Error) -> VmError {
    VmError::Io(format!("{}: {}", context, e))
}

/// Whether `arg` is a `name=value` command-line assignment.
pub fn split_assignment(arg: &str) -> Option<(&str, &str)> {
    let (name, value) = arg.split_once('=')?;
    let mut chars = name.chars();
    let first = chars.next()?;
    if (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Some((name, value))
    } else {
        None
    }
}

/// Process backslash escapes in a command-line value.
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('a') => out.push('\x07'),
            Some('b') => out.push('\x08'),
            Some('f') => out.push('\x0c'),
            Some('v') => out.push('\x0b'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('/') => out.push('/'),
            Some(d @ '0'..='7') => {
                let mut code = d.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(next) => {
                            code = code * 8 + next;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.extend(char::from_u32(code));
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

// ── VM input and output ─────────────────────────────────────────────

impl VM {
    fn take_stdin(&mut self) -> Box<dyn Read> {
        self.io
            .stdin
            .take()
            .unwrap_or_else(|| Box::new(io::stdin()))
    }

    /// Open the next file operand from ARGV, applying `var=value` operands
    /// on the way. Returns false when no input remains.
    fn open_next_input(&mut self) -> Result<bool, VmError> {
        while (self.io.next_arg as f64) < self.specials.argc {
            let index = self.io.next_arg;
            self.io.next_arg += 1;
            let arg = self.argv(index);
            if arg.is_empty() {
                continue;
            }
            if let Some((name, value)) = split_assignment(&arg) {
                self.assign_command_line(name, value)?;
                continue;
            }
            self.io.opened_operand = true;
            let input: Box<dyn Read> = if arg == "-" {
                self.take_stdin()
            } else {
                let file = File::open(&arg)
                    .map_err(|e| io_error(&format!("can't open file {:?}", arg), e))?;
                Box::new(file)
            };
            debug!(file = %arg, "opened input");
            self.specials.filename = arg;
            self.specials.fnr = 0.0;
            self.io.main = Some(RecordReader::new(input));
            return Ok(true);
        }
        if !self.io.opened_operand {
            self.io.opened_operand = true;
            let input = self.take_stdin();
            self.specials.fnr = 0.0;
            self.io.main = Some(RecordReader::new(input));
            return Ok(true);
        }
        Ok(false)
    }

    /// Next record of the main input, advancing through the operands.
    pub(crate) fn next_main_record(&mut self) -> Result<Option<String>, VmError> {
        loop {
            if let Some(reader) = self.io.main.as_mut() {
                let next = reader
                    .read_record(&self.record_sep)
                    .map_err(|e| io_error("reading input", e))?;
                match next {
                    Some((record, rt)) => {
                        self.specials.rt = rt;
                        self.specials.nr += 1.0;
                        self.specials.fnr += 1.0;
                        return Ok(Some(record));
                    }
                    None => self.io.main = None,
                }
            }
            if !self.open_next_input()? {
                return Ok(None);
            }
        }
    }

    /// Drop the current input file so the next read moves on.
    pub(crate) fn skip_file(&mut self) {
        self.io.main = None;
    }

    /// Read one record for a getline form. Returns the status (1, 0 or
    /// -1) and the record on success.
    pub(crate) fn getline_read(
        &mut self,
        kind: GetlineKind,
        name: Option<&str>,
    ) -> Result<(f64, Option<String>), VmError> {
        let name = match (kind, name) {
            (GetlineKind::Main, _) | (_, None) => {
                return Ok(match self.next_main_record()? {
                    Some(record) => (1.0, Some(record)),
                    None => (0.0, None),
                });
            }
            (_, Some(name)) => name,
        };
        let stream = match self.io.inputs.entry(name.to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let opened = if kind == GetlineKind::Command {
                    if self.config.no_exec {
                        return Err(VmError::NoExec(name.to_string()));
                    }
                    flush_sink(&mut self.output)?;
                    spawn_input_command(name)
                } else if name == "-" || name == "/dev/stdin" {
                    Ok(InputStream {
                        reader: RecordReader::new(
                            self.io
                                .stdin
                                .take()
                                .unwrap_or_else(|| Box::new(io::stdin())),
                        ),
                        child: None,
                    })
                } else {
                    File::open(name).map(|file| InputStream {
                        reader: RecordReader::new(Box::new(file)),
                        child: None,
                    })
                };
                match opened {
                    Ok(stream) => e.insert(stream),
                    Err(err) => {
                        debug!(name, error = %err, "getline source unavailable");
                        return Ok((-1.0, None));
                    }
                }
            }
        };
        match stream.reader.read_record(&self.record_sep) {
            Ok(Some((record, rt))) => {
                self.specials.rt = rt;
                if kind == GetlineKind::Command {
                    self.specials.nr += 1.0;
                }
                Ok((1.0, Some(record)))
            }
            Ok(None) => Ok((0.0, None)),
            Err(err) => {
                warn!(name, error = %err, "read failed");
                Ok((-1.0, None))
            }
        }
    }

    /// Write `text` to the destination of a print statement.
    pub(crate) fn write_output(
        &mut self,
        redirect: Redirect,
        dest: Option<&str>,
        text: &str,
    ) -> Result<(), VmError> {
        let name = match (redirect, dest) {
            (Redirect::Stdout, _) | (_, None) => {
                return self
                    .output
                    .write_all(text.as_bytes())
                    .map_err(|e| io_error("writing output", e));
            }
            (_, Some("/dev/stdout" | "-")) => {
                return self
                    .output
                    .write_all(text.as_bytes())
                    .map_err(|e| io_error("writing output", e));
            }
            (_, Some(name)) => name,
        };
        if !self.io.outputs.contains_key(name) && redirect == Redirect::Pipe {
            // Earlier output must appear before the command's
            flush_sink(&mut self.output)?;
        }
        let no_exec = self.config.no_exec;
        let stream = match self.io.outputs.entry(name.to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(open_output(redirect, name, no_exec)?),
        };
        stream
            .write_all(text.as_bytes())
            .map_err(|e| io_error(&format!("writing to {:?}", name), e))
    }

    /// `close(name)`: the exit status of a command, 0 for a file, -1 if
    /// nothing by that name is open.
    pub(crate) fn close_stream(&mut self, name: &str) -> Result<f64, VmError> {
        if let Some(stream) = self.io.outputs.remove(name) {
            return self.close_output(name, stream);
        }
        if let Some(stream) = self.io.inputs.remove(name) {
            return Ok(close_input(name, stream));
        }
        Ok(-1.0)
    }

    fn close_output(&mut self, name: &str, stream: OutputStream) -> Result<f64, VmError> {
        match stream {
            OutputStream::File(mut w) => Ok(match w.flush() {
                Ok(()) => 0.0,
                Err(e) => {
                    warn!(name, error = %e, "close failed");
                    -1.0
                }
            }),
            OutputStream::Stderr => Ok(0.0),
            OutputStream::Pipe {
                mut child,
                stdin,
                reader,
            } => {
                if let Some(mut w) = stdin {
                    if let Err(e) = w.flush() {
                        warn!(name, error = %e, "flushing pipe failed");
                    }
                }
                let status = child
                    .wait()
                    .map_err(|e| io_error("waiting for command", e))?;
                if let Some(handle) = reader {
                    match handle.join() {
                        Ok(Ok(bytes)) => self
                            .output
                            .write_all(&bytes)
                            .map_err(|e| io_error("writing output", e))?,
                        Ok(Err(e)) => warn!(name, error = %e, "reading command output failed"),
                        Err(_) => warn!(name, "command output reader panicked"),
                    }
                }
                Ok(exit_code(status))
            }
        }
    }

    /// `fflush()` with no argument flushes everything; otherwise only the
    /// named stream, returning -1 if it is not open.
    pub(crate) fn flush_stream(&mut self, name: Option<&str>) -> Result<f64, VmError> {
        match name {
            None => {
                self.flush_all()?;
                Ok(0.0)
            }
            Some("/dev/stdout" | "-") => {
                flush_sink(&mut self.output)?;
                Ok(0.0)
            }
            Some(name) => match self.io.outputs.get_mut(name) {
                Some(stream) => Ok(match stream.flush() {
                    Ok(()) => 0.0,
                    Err(e) => {
                        warn!(name, error = %e, "flush failed");
                        -1.0
                    }
                }),
                None => Ok(-1.0),
            },
        }
    }

    pub(crate) fn flush_all(&mut self) -> Result<(), VmError> {
        flush_sink(&mut self.output)?;
        for (name, stream) in self.io.outputs.iter_mut() {
            if let Err(e) = stream.flush() {
                warn!(name = %name, error = %e, "flush failed");
            }
        }
        Ok(())
    }

    /// Close every redirected stream, in name order.
    pub(crate) fn close_all(&mut self) -> Result<(), VmError> {
        let mut names: Vec<String> = self.io.outputs.keys().cloned().collect();
        names.sort();
        for name in names {
            if let Some(stream) = self.io.outputs.remove(&name) {
                self.close_output(&name, stream)?;
            }
        }
        let inputs: Vec<(String, InputStream)> = self.io.inputs.drain().collect();
        for (name, stream) in inputs {
            close_input(&name, stream);
        }
        flush_sink(&mut self.output)
    }

    /// `system(cmd)`: run through `sh -c`, copying its stdout into the VM
    /// output. Returns the exit status.
    pub(crate) fn run_system(&mut self, command: &str) -> Result<f64, VmError> {
        if self.config.no_exec {
            return Err(VmError::NoExec(command.to_string()));
        }
        self.flush_all()?;
        let result = shell(command)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .output();
        match result {
            Ok(out) => {
                self.output
                    .write_all(&out.stdout)
                    .map_err(|e| io_error("writing output", e))?;
                Ok(exit_code(out.status))
            }
            Err(e) => {
                warn!(command, error = %e, "system() failed to start");
                Ok(-1.0)
            }
        }
    }
}

fn flush_sink(sink: &mut Sink) -> Result<(), VmError> {
    sink.flush().map_err(|e| io_error("flushing output", e))
}

fn open_output(redirect: Redirect, name: &str, no_exec: bool) -> Result<OutputStream, VmError> {
    if name == "/dev/stderr" {
        return Ok(OutputStream::Stderr);
    }
    if no_exec {
        return Err(VmError::NoExec(name.to_string()));
    }
    match redirect {
        Redirect::Pipe => {
            let mut child = shell(name)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .spawn()
                .map_err(|e| io_error(&format!("can't start {:?}", name), e))?;
            let stdin = child.stdin.take().map(BufWriter::new);
            let reader = child.stdout.take().map(|mut out| {
                std::thread::spawn(move || -> io::Result<Vec<u8>> {
                    let mut bytes = Vec::new();
                    out.read_to_end(&mut bytes)?;
                    Ok(bytes)
                })
            });
            debug!(command = name, "opened output pipe");
            Ok(OutputStream::Pipe {
                child,
                stdin,
                reader,
            })
        }
        _ => {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .append(redirect == Redirect::Append)
                .truncate(redirect != Redirect::Append)
                .open(name)
                .map_err(|e| io_error(&format!("can't redirect to {:?}", name), e))?;
            Ok(OutputStream::File(BufWriter::new(file)))
        }
    }
}

fn spawn_input_command(command: &str) -> io::Result<InputStream> {
    let mut child = shell(command)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
    Ok(InputStream {
        reader: RecordReader::new(Box::new(stdout)),
        child: Some(child),
    })
}

fn close_input(name: &str, stream: InputStream) -> f64 {
    let InputStream { reader, child } = stream;
    drop(reader);
    match child {
        Some(mut child) => match child.wait() {
            Ok(status) => exit_code(status),
            Err(e) => {
                warn!(name, error = %e, "waiting for command failed");
                -1.0
            }
        },
        None => 0.0,
    }
}
