//! Wire structs exchanged between master and slave, grounded in `def.h`'s
//! `command_t`/`response_t` and the result/command enums. Per the Design
//! Notes, the original's raw process-local pointers (`void *child`,
//! `void *masterEcho`) are replaced with monotonically increasing `u64`
//! ids and a lookup table on whichever side owns the pointee — safer to
//! pass across the master/slave trust boundary than a pointer a compromised
//! peer could dereference.

use crate::error::SysError;
use crate::wire::{self, ReadOutcome, Sink};
use std::os::fd::AsFd;

/// Fixed wire size of `CommandHeader`: `u32` + `u64` + `u64` + `i32`.
pub const COMMAND_HEADER_LEN: usize = 4 + 8 + 8 + 4;
/// Fixed wire size of `ResponseHeader`: `u64` + `u32` + `u64` + `i32`.
pub const RESPONSE_HEADER_LEN: usize = 8 + 4 + 8 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    Exec = 1,
    CloseHandle = 2,
    Kill = 3,
    ExecPipe = 4,
    Quit = 5,
}

impl Command {
    pub fn from_u32(v: u32) -> Result<Self, SysError> {
        match v {
            1 => Ok(Command::Exec),
            2 => Ok(Command::CloseHandle),
            3 => Ok(Command::Kill),
            4 => Ok(Command::ExecPipe),
            5 => Ok(Command::Quit),
            _ => Err(SysError::Protocol("unknown command code")),
        }
    }

    pub fn is_exec(self) -> bool {
        matches!(self, Command::Exec | Command::ExecPipe)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseResult {
    Null = 0,
    ChildCreated = 1,
    ChildDied = 2,
    StdoutData = 3,
    StderrData = 4,
    GotSignal = 5,
}

impl ResponseResult {
    pub fn from_u32(v: u32) -> Result<Self, SysError> {
        match v {
            0 => Ok(ResponseResult::Null),
            1 => Ok(ResponseResult::ChildCreated),
            2 => Ok(ResponseResult::ChildDied),
            3 => Ok(ResponseResult::StdoutData),
            4 => Ok(ResponseResult::StderrData),
            5 => Ok(ResponseResult::GotSignal),
            _ => Err(SysError::Protocol("unknown result code")),
        }
    }
}

/// Master -> slave command header. Followed, for `EXEC`/`EXEC_PIPE`, by a
/// variable record (the program path), a variable record (the user name,
/// empty meaning "do not drop privileges"), and two packs (argv, then envp).
#[derive(Debug, Clone, Copy)]
pub struct CommandHeader {
    pub command: Command,
    /// Opaque token the master attaches to this command; echoed back
    /// verbatim on every response caused by it, so the master can correlate
    /// asynchronous responses without relying on ordering.
    pub master_echo: u64,
    /// Slave-assigned child token. Meaningful for `CLOSE_HANDLE`/`KILL`
    /// (identifies which child); ignored for `EXEC`/`EXEC_PIPE`/`QUIT`.
    pub param_child: u64,
    /// `KILL`'s signal number; otherwise unused.
    pub param_int: i32,
}

impl CommandHeader {
    pub fn to_bytes(self) -> [u8; COMMAND_HEADER_LEN] {
        let mut buf = [0u8; COMMAND_HEADER_LEN];
        buf[0..4].copy_from_slice(&(self.command as u32).to_ne_bytes());
        buf[4..12].copy_from_slice(&self.master_echo.to_ne_bytes());
        buf[12..20].copy_from_slice(&self.param_child.to_ne_bytes());
        buf[20..24].copy_from_slice(&self.param_int.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; COMMAND_HEADER_LEN]) -> Result<Self, SysError> {
        let command = Command::from_u32(u32::from_ne_bytes(buf[0..4].try_into().unwrap()))?;
        let master_echo = u64::from_ne_bytes(buf[4..12].try_into().unwrap());
        let param_child = u64::from_ne_bytes(buf[12..20].try_into().unwrap());
        let param_int = i32::from_ne_bytes(buf[20..24].try_into().unwrap());
        Ok(CommandHeader { command, master_echo, param_child, param_int })
    }

    /// Read a command header off `fd`. `probe_first` lets the slave's main
    /// loop test readiness without blocking — the slave always calls this
    /// only once poll has already confirmed data is pending, so it passes
    /// `false`; it's provided for symmetry with `ResponseHeader::read`.
    pub fn read<Fd: AsFd>(fd: Fd, probe_first: bool) -> Result<ReadOutcome<Self>, SysError> {
        let mut buf = [0u8; COMMAND_HEADER_LEN];
        match wire::read_full(fd, &mut buf, probe_first)? {
            ReadOutcome::WouldBlock => Ok(ReadOutcome::WouldBlock),
            ReadOutcome::Complete(()) => Ok(ReadOutcome::Complete(Self::from_bytes(&buf)?)),
        }
    }

    pub fn write_blocking<Fd: AsFd>(self, fd: Fd) -> Result<(), SysError> {
        wire::write_full(fd, &self.to_bytes())
    }

    pub fn write_yielding<Fd: AsFd>(
        self,
        fd: Fd,
        on_would_block: impl FnMut() -> Result<(), SysError>,
    ) -> Result<(), SysError> {
        wire::write_full_yielding(fd, &self.to_bytes(), on_would_block)
    }
}

/// Slave -> master response header. Followed, for `STDOUT_DATA`/
/// `STDERR_DATA`, by a single variable record carrying the captured chunk.
#[derive(Debug, Clone, Copy)]
pub struct ResponseHeader {
    /// Echoes the `master_echo` of the command that caused this response,
    /// or 0 for responses not caused by any single command (`CHILD_DIED`,
    /// `GOT_SIGNAL`, data chunks arriving after the fact).
    pub master_echo: u64,
    pub result: ResponseResult,
    /// Slave token of the child this response concerns, or 0 when not
    /// applicable (`GOT_SIGNAL`).
    pub param_child: u64,
    /// `CHILD_CREATED`'s pid (0 on fork failure), `CHILD_DIED`'s raw wait
    /// status, `GOT_SIGNAL`'s signal number. Unused for data responses
    /// (the length travels in the trailing variable record instead).
    pub param_int: i32,
}

impl ResponseHeader {
    pub fn to_bytes(self) -> [u8; RESPONSE_HEADER_LEN] {
        let mut buf = [0u8; RESPONSE_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.master_echo.to_ne_bytes());
        buf[8..12].copy_from_slice(&(self.result as u32).to_ne_bytes());
        buf[12..20].copy_from_slice(&self.param_child.to_ne_bytes());
        buf[20..24].copy_from_slice(&self.param_int.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; RESPONSE_HEADER_LEN]) -> Result<Self, SysError> {
        let master_echo = u64::from_ne_bytes(buf[0..8].try_into().unwrap());
        let result = ResponseResult::from_u32(u32::from_ne_bytes(buf[8..12].try_into().unwrap()))?;
        let param_child = u64::from_ne_bytes(buf[12..20].try_into().unwrap());
        let param_int = i32::from_ne_bytes(buf[20..24].try_into().unwrap());
        Ok(ResponseHeader { master_echo, result, param_child, param_int })
    }

    pub fn read<Fd: AsFd>(fd: Fd, probe_first: bool) -> Result<ReadOutcome<Self>, SysError> {
        let mut buf = [0u8; RESPONSE_HEADER_LEN];
        match wire::read_full(fd, &mut buf, probe_first)? {
            ReadOutcome::WouldBlock => Ok(ReadOutcome::WouldBlock),
            ReadOutcome::Complete(()) => Ok(ReadOutcome::Complete(Self::from_bytes(&buf)?)),
        }
    }

    pub fn write_blocking<Fd: AsFd>(self, fd: Fd) -> Result<(), SysError> {
        wire::write_full(fd, &self.to_bytes())
    }
}

/// The `EXEC`/`EXEC_PIPE` payload that follows a `CommandHeader`: program
/// path, optional user name, argv, envp.
pub struct ExecRequest {
    pub program: Vec<u8>,
    pub user: Vec<u8>,
    pub argv: Vec<Vec<u8>>,
    pub envp: Vec<Vec<u8>>,
}

impl ExecRequest {
    pub fn write(&self, sink: &mut impl Sink) -> Result<(), SysError> {
        wire::write_variable(sink, &self.program)?;
        wire::write_variable(sink, &self.user)?;
        wire::write_pack(sink, &self.argv)?;
        wire::write_pack(sink, &self.envp)
    }

    pub fn read<Fd: AsFd + Copy>(fd: Fd) -> Result<Self, SysError> {
        let program = wire::read_variable(fd)?;
        let user = wire::read_variable(fd)?;
        let argv = wire::read_pack(fd)?;
        let envp = wire::read_pack(fd)?;
        Ok(ExecRequest { program, user, argv, envp })
    }
}

/// The variable record that follows a `STDOUT_DATA`/`STDERR_DATA` response.
pub fn write_data_chunk(sink: &mut impl Sink, chunk: &[u8]) -> Result<(), SysError> {
    wire::write_variable(sink, chunk)
}

pub fn read_data_chunk<Fd: AsFd>(fd: Fd) -> Result<Vec<u8>, SysError> {
    wire::read_variable(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_header_round_trips() {
        let hdr = CommandHeader { command: Command::Kill, master_echo: 0xdead_beef, param_child: 7, param_int: 15 };
        let bytes = hdr.to_bytes();
        let back = CommandHeader::from_bytes(&bytes).unwrap();
        assert_eq!(back.command, Command::Kill);
        assert_eq!(back.master_echo, 0xdead_beef);
        assert_eq!(back.param_child, 7);
        assert_eq!(back.param_int, 15);
    }

    #[test]
    fn response_header_round_trips() {
        let hdr = ResponseHeader { master_echo: 42, result: ResponseResult::ChildDied, param_child: 3, param_int: -1 };
        let bytes = hdr.to_bytes();
        let back = ResponseHeader::from_bytes(&bytes).unwrap();
        assert_eq!(back.master_echo, 42);
        assert_eq!(back.result, ResponseResult::ChildDied);
        assert_eq!(back.param_child, 3);
        assert_eq!(back.param_int, -1);
    }

    #[test]
    fn unknown_command_code_is_protocol_error() {
        let mut buf = [0u8; COMMAND_HEADER_LEN];
        buf[0..4].copy_from_slice(&99u32.to_ne_bytes());
        assert!(CommandHeader::from_bytes(&buf).is_err());
    }
}
