//! Structured system packets
//!
//! One variant per opcode the channel core understands. `parse` reads the
//! payload after the opcode; `build` writes it back. Both directions are
//! implemented for every variant so that test clients speak the same types
//! as the server.

use bytes::Bytes;

use crate::error::{ChannelError, Result};
use crate::network::frame::{FrameReader, FrameWriter};
use crate::network::opcode::Opcode;

/// Request/response correlation packet (`MSG_SYS_ACK`)
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub ack_handle: u32,
    /// Variable-length buffer response instead of the fixed 4-byte simple one
    pub is_buffer: bool,
    pub error_code: u8,
    pub data: Bytes,
}

impl Ack {
    pub fn simple(ack_handle: u32, error_code: u8, data: &[u8]) -> Self {
        Self {
            ack_handle,
            is_buffer: false,
            error_code,
            data: Bytes::copy_from_slice(data),
        }
    }

    pub fn buffer(ack_handle: u32, error_code: u8, data: impl Into<Bytes>) -> Self {
        Self {
            ack_handle,
            is_buffer: true,
            error_code,
            data: data.into(),
        }
    }

    fn parse(r: &mut FrameReader<'_>) -> Result<Self> {
        let ack_handle = r.u32()?;
        let is_buffer = r.bool()?;
        let error_code = r.u8()?;
        let mut size = r.u16()? as usize;
        if size == 0xFFFF {
            size = r.u32()? as usize;
        }
        let data = if is_buffer { r.bytes(size)? } else { r.bytes(4)? };
        Ok(Self {
            ack_handle,
            is_buffer,
            error_code,
            data: Bytes::copy_from_slice(data),
        })
    }

    fn build(&self, w: &mut FrameWriter) {
        w.u32(self.ack_handle).bool(self.is_buffer).u8(self.error_code);
        if self.is_buffer {
            if self.data.len() < 0xFFFF {
                w.u16(self.data.len() as u16);
            } else {
                w.u16(0xFFFF).u32(self.data.len() as u32);
            }
            w.bytes(&self.data);
        } else {
            w.u16(0);
            if self.data.len() >= 4 {
                w.bytes(&self.data[..4]);
            } else {
                w.bytes(&[0, 0, 0, 0]);
            }
        }
    }

    /// The 4-byte simple payload as a big-endian integer
    pub fn simple_u32(&self) -> u32 {
        match self.data.get(..4) {
            Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            None => 0,
        }
    }
}

/// Every packet the channel core parses or emits
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    End,
    Nop,
    ExtendThreshold,
    Ack(Ack),
    TerminalLog {
        ack_handle: u32,
        log_id: u32,
        entries: Vec<[u32; 9]>,
    },
    Login {
        ack_handle: u32,
        char_id: u32,
        login_token_number: u32,
        request_version: u16,
        token: String,
    },
    Logout {
        logout_type: u8,
    },
    Ping {
        ack_handle: u32,
    },
    Time {
        get_remote_time: bool,
        timestamp: u32,
    },
    CastBinary {
        unk: u32,
        broadcast_type: u8,
        message_type: u8,
        payload: Bytes,
    },
    CastedBinary {
        char_id: u32,
        broadcast_type: u8,
        message_type: u8,
        payload: Bytes,
    },

    // Stages
    CreateStage {
        ack_handle: u32,
        unk: u8,
        player_count: u8,
        stage_id: String,
    },
    StageDestruct,
    EnterStage {
        ack_handle: u32,
        unk: u8,
        stage_id: String,
    },
    BackStage {
        ack_handle: u32,
    },
    MoveStage {
        ack_handle: u32,
        unk: u8,
        stage_id: String,
    },
    LeaveStage,
    LockStage {
        ack_handle: u32,
        unk0: u8,
        unk1: u8,
        stage_id: String,
    },
    UnlockStage {
        unk: u16,
    },
    ReserveStage {
        ack_handle: u32,
        ready: u8,
        stage_id: String,
    },
    UnreserveStage,
    SetStagePass {
        unk: u8,
        password: String,
    },
    WaitStageBinary {
        ack_handle: u32,
        binary_type0: u8,
        binary_type1: u8,
        unk: u32,
        stage_id: String,
    },
    SetStageBinary {
        binary_type0: u8,
        binary_type1: u8,
        stage_id: String,
        payload: Bytes,
    },
    GetStageBinary {
        ack_handle: u32,
        binary_type0: u8,
        binary_type1: u8,
        unk: u32,
        stage_id: String,
    },
    EnumerateClient {
        ack_handle: u32,
        unk: u8,
        get_type: u8,
        stage_id: String,
    },
    EnumerateStage {
        ack_handle: u32,
        unk: u8,
        stage_prefix: String,
    },

    // Semaphores
    CreateSemaphore {
        ack_handle: u32,
        unk: u16,
        semaphore_id: String,
    },
    CreateAcquireSemaphore {
        ack_handle: u32,
        unk: u16,
        player_count: u8,
        semaphore_id: String,
    },
    DeleteSemaphore {
        ack_handle: u32,
        semaphore_id: u32,
    },
    AcquireSemaphore {
        ack_handle: u32,
        semaphore_id: String,
    },
    ReleaseSemaphore {
        ack_handle: u32,
    },
    CheckSemaphore {
        ack_handle: u32,
        semaphore_id: String,
    },

    // World-event registers
    OperateRegister {
        ack_handle: u32,
        register_id: u32,
        payload: Bytes,
    },
    LoadRegister {
        ack_handle: u32,
        register_id: u32,
        values: u8,
    },
    NotifyRegister {
        register_id: u32,
    },

    // Objects
    CreateObject {
        ack_handle: u32,
        x: f32,
        y: f32,
        z: f32,
        unk: u32,
    },
    DeleteObject {
        object_id: u32,
    },
    PositionObject {
        object_id: u32,
        x: f32,
        y: f32,
        z: f32,
    },
    DuplicateObject {
        object_id: u32,
        x: f32,
        y: f32,
        z: f32,
        unk: u32,
        owner_char_id: u32,
    },
    CleanupObject,

    // Users
    InsertUser {
        char_id: u32,
    },
    DeleteUser {
        char_id: u32,
    },
    NotifyUserBinary {
        char_id: u32,
        binary_type: u8,
    },
}

impl Packet {
    pub fn opcode(&self) -> Opcode {
        use Packet::*;
        match self {
            End => Opcode::MSG_SYS_END,
            Nop => Opcode::MSG_SYS_NOP,
            ExtendThreshold => Opcode::MSG_SYS_EXTEND_THRESHOLD,
            Ack(_) => Opcode::MSG_SYS_ACK,
            TerminalLog { .. } => Opcode::MSG_SYS_TERMINAL_LOG,
            Login { .. } => Opcode::MSG_SYS_LOGIN,
            Logout { .. } => Opcode::MSG_SYS_LOGOUT,
            Ping { .. } => Opcode::MSG_SYS_PING,
            Time { .. } => Opcode::MSG_SYS_TIME,
            CastBinary { .. } => Opcode::MSG_SYS_CAST_BINARY,
            CastedBinary { .. } => Opcode::MSG_SYS_CASTED_BINARY,
            CreateStage { .. } => Opcode::MSG_SYS_CREATE_STAGE,
            StageDestruct => Opcode::MSG_SYS_STAGE_DESTRUCT,
            EnterStage { .. } => Opcode::MSG_SYS_ENTER_STAGE,
            BackStage { .. } => Opcode::MSG_SYS_BACK_STAGE,
            MoveStage { .. } => Opcode::MSG_SYS_MOVE_STAGE,
            LeaveStage => Opcode::MSG_SYS_LEAVE_STAGE,
            LockStage { .. } => Opcode::MSG_SYS_LOCK_STAGE,
            UnlockStage { .. } => Opcode::MSG_SYS_UNLOCK_STAGE,
            ReserveStage { .. } => Opcode::MSG_SYS_RESERVE_STAGE,
            UnreserveStage => Opcode::MSG_SYS_UNRESERVE_STAGE,
            SetStagePass { .. } => Opcode::MSG_SYS_SET_STAGE_PASS,
            WaitStageBinary { .. } => Opcode::MSG_SYS_WAIT_STAGE_BINARY,
            SetStageBinary { .. } => Opcode::MSG_SYS_SET_STAGE_BINARY,
            GetStageBinary { .. } => Opcode::MSG_SYS_GET_STAGE_BINARY,
            EnumerateClient { .. } => Opcode::MSG_SYS_ENUMERATE_CLIENT,
            EnumerateStage { .. } => Opcode::MSG_SYS_ENUMERATE_STAGE,
            CreateSemaphore { .. } => Opcode::MSG_SYS_CREATE_SEMAPHORE,
            CreateAcquireSemaphore { .. } => Opcode::MSG_SYS_CREATE_ACQUIRE_SEMAPHORE,
            DeleteSemaphore { .. } => Opcode::MSG_SYS_DELETE_SEMAPHORE,
            AcquireSemaphore { .. } => Opcode::MSG_SYS_ACQUIRE_SEMAPHORE,
            ReleaseSemaphore { .. } => Opcode::MSG_SYS_RELEASE_SEMAPHORE,
            CheckSemaphore { .. } => Opcode::MSG_SYS_CHECK_SEMAPHORE,
            OperateRegister { .. } => Opcode::MSG_SYS_OPERATE_REGISTER,
            LoadRegister { .. } => Opcode::MSG_SYS_LOAD_REGISTER,
            NotifyRegister { .. } => Opcode::MSG_SYS_NOTIFY_REGISTER,
            CreateObject { .. } => Opcode::MSG_SYS_CREATE_OBJECT,
            DeleteObject { .. } => Opcode::MSG_SYS_DELETE_OBJECT,
            PositionObject { .. } => Opcode::MSG_SYS_POSITION_OBJECT,
            DuplicateObject { .. } => Opcode::MSG_SYS_DUPLICATE_OBJECT,
            CleanupObject => Opcode::MSG_SYS_CLEANUP_OBJECT,
            InsertUser { .. } => Opcode::MSG_SYS_INSERT_USER,
            DeleteUser { .. } => Opcode::MSG_SYS_DELETE_USER,
            NotifyUserBinary { .. } => Opcode::MSG_SYS_NOTIFY_USER_BINARY,
        }
    }

    /// Ack handle of a request, used to answer it with a failure ack
    pub fn ack_handle(&self) -> Option<u32> {
        use Packet::*;
        match self {
            TerminalLog { ack_handle, .. }
            | Login { ack_handle, .. }
            | Ping { ack_handle }
            | CreateStage { ack_handle, .. }
            | EnterStage { ack_handle, .. }
            | BackStage { ack_handle }
            | MoveStage { ack_handle, .. }
            | LockStage { ack_handle, .. }
            | ReserveStage { ack_handle, .. }
            | WaitStageBinary { ack_handle, .. }
            | GetStageBinary { ack_handle, .. }
            | EnumerateClient { ack_handle, .. }
            | EnumerateStage { ack_handle, .. }
            | CreateSemaphore { ack_handle, .. }
            | CreateAcquireSemaphore { ack_handle, .. }
            | DeleteSemaphore { ack_handle, .. }
            | AcquireSemaphore { ack_handle, .. }
            | ReleaseSemaphore { ack_handle }
            | CheckSemaphore { ack_handle, .. }
            | OperateRegister { ack_handle, .. }
            | LoadRegister { ack_handle, .. }
            | CreateObject { ack_handle, .. } => Some(*ack_handle),
            Ack(ack) => Some(ack.ack_handle),
            _ => None,
        }
    }

    /// Whether the client expects a buffer-shaped ack for this request
    pub fn wants_buffer_ack(&self) -> bool {
        matches!(
            self,
            Packet::WaitStageBinary { .. }
                | Packet::GetStageBinary { .. }
                | Packet::EnumerateClient { .. }
                | Packet::EnumerateStage { .. }
                | Packet::OperateRegister { .. }
                | Packet::LoadRegister { .. }
        )
    }

    /// Parse the payload that follows `opcode` in a packet group
    pub fn parse(opcode: Opcode, r: &mut FrameReader<'_>) -> Result<Self> {
        use Packet::*;
        let packet = match opcode {
            Opcode::MSG_SYS_END => End,
            Opcode::MSG_SYS_NOP => Nop,
            Opcode::MSG_SYS_EXTEND_THRESHOLD => ExtendThreshold,
            Opcode::MSG_SYS_ACK => Ack(self::Ack::parse(r)?),
            Opcode::MSG_SYS_TERMINAL_LOG => {
                let ack_handle = r.u32()?;
                let log_id = r.u32()?;
                let count = r.u16()?;
                r.skip(2)?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let mut entry = [0u32; 9];
                    for field in entry.iter_mut() {
                        *field = r.u32()?;
                    }
                    entries.push(entry);
                }
                TerminalLog { ack_handle, log_id, entries }
            }
            Opcode::MSG_SYS_LOGIN => {
                let ack_handle = r.u32()?;
                let char_id = r.u32()?;
                let login_token_number = r.u32()?;
                r.skip(2)?;
                let request_version = r.u16()?;
                let _char_id_1 = r.u32()?;
                r.skip(2)?;
                let _token_len = r.u16()?;
                let token = r.string(17)?;
                Login {
                    ack_handle,
                    char_id,
                    login_token_number,
                    request_version,
                    token,
                }
            }
            Opcode::MSG_SYS_LOGOUT => Logout { logout_type: r.u8()? },
            Opcode::MSG_SYS_PING => Ping { ack_handle: r.u32()? },
            Opcode::MSG_SYS_TIME => Time {
                get_remote_time: r.bool()?,
                timestamp: r.u32()?,
            },
            Opcode::MSG_SYS_CAST_BINARY => {
                let unk = r.u32()?;
                let broadcast_type = r.u8()?;
                let message_type = r.u8()?;
                let size = r.u16()? as usize;
                CastBinary {
                    unk,
                    broadcast_type,
                    message_type,
                    payload: Bytes::copy_from_slice(r.bytes(size)?),
                }
            }
            Opcode::MSG_SYS_CASTED_BINARY => {
                let char_id = r.u32()?;
                let broadcast_type = r.u8()?;
                let message_type = r.u8()?;
                let size = r.u16()? as usize;
                CastedBinary {
                    char_id,
                    broadcast_type,
                    message_type,
                    payload: Bytes::copy_from_slice(r.bytes(size)?),
                }
            }
            Opcode::MSG_SYS_CREATE_STAGE => CreateStage {
                ack_handle: r.u32()?,
                unk: r.u8()?,
                player_count: r.u8()?,
                stage_id: r.string_u8()?,
            },
            Opcode::MSG_SYS_STAGE_DESTRUCT => StageDestruct,
            Opcode::MSG_SYS_ENTER_STAGE => EnterStage {
                ack_handle: r.u32()?,
                unk: r.u8()?,
                stage_id: r.string_u8()?,
            },
            Opcode::MSG_SYS_BACK_STAGE => BackStage { ack_handle: r.u32()? },
            Opcode::MSG_SYS_MOVE_STAGE => MoveStage {
                ack_handle: r.u32()?,
                unk: r.u8()?,
                stage_id: r.string_u8()?,
            },
            Opcode::MSG_SYS_LEAVE_STAGE => LeaveStage,
            Opcode::MSG_SYS_LOCK_STAGE => LockStage {
                ack_handle: r.u32()?,
                unk0: r.u8()?,
                unk1: r.u8()?,
                stage_id: r.string_u8()?,
            },
            Opcode::MSG_SYS_UNLOCK_STAGE => UnlockStage { unk: r.u16()? },
            Opcode::MSG_SYS_RESERVE_STAGE => ReserveStage {
                ack_handle: r.u32()?,
                ready: r.u8()?,
                stage_id: r.string_u8()?,
            },
            Opcode::MSG_SYS_UNRESERVE_STAGE => UnreserveStage,
            Opcode::MSG_SYS_SET_STAGE_PASS => SetStagePass {
                unk: r.u8()?,
                password: r.string_u8()?,
            },
            Opcode::MSG_SYS_WAIT_STAGE_BINARY => WaitStageBinary {
                ack_handle: r.u32()?,
                binary_type0: r.u8()?,
                binary_type1: r.u8()?,
                unk: r.u32()?,
                stage_id: r.string_u8()?,
            },
            Opcode::MSG_SYS_SET_STAGE_BINARY => {
                let binary_type0 = r.u8()?;
                let binary_type1 = r.u8()?;
                let id_len = r.u8()? as usize;
                let size = r.u16()? as usize;
                let stage_id = r.string(id_len)?;
                SetStageBinary {
                    binary_type0,
                    binary_type1,
                    stage_id,
                    payload: Bytes::copy_from_slice(r.bytes(size)?),
                }
            }
            Opcode::MSG_SYS_GET_STAGE_BINARY => GetStageBinary {
                ack_handle: r.u32()?,
                binary_type0: r.u8()?,
                binary_type1: r.u8()?,
                unk: r.u32()?,
                stage_id: r.string_u8()?,
            },
            Opcode::MSG_SYS_ENUMERATE_CLIENT => EnumerateClient {
                ack_handle: r.u32()?,
                unk: r.u8()?,
                get_type: r.u8()?,
                stage_id: r.string_u8()?,
            },
            Opcode::MSG_SYS_ENUMERATE_STAGE => EnumerateStage {
                ack_handle: r.u32()?,
                unk: r.u8()?,
                stage_prefix: r.string_u8()?,
            },
            Opcode::MSG_SYS_CREATE_SEMAPHORE => CreateSemaphore {
                ack_handle: r.u32()?,
                unk: r.u16()?,
                semaphore_id: r.string_u8()?,
            },
            Opcode::MSG_SYS_CREATE_ACQUIRE_SEMAPHORE => CreateAcquireSemaphore {
                ack_handle: r.u32()?,
                unk: r.u16()?,
                player_count: r.u8()?,
                semaphore_id: r.string_u8()?,
            },
            Opcode::MSG_SYS_DELETE_SEMAPHORE => DeleteSemaphore {
                ack_handle: r.u32()?,
                semaphore_id: r.u32()?,
            },
            Opcode::MSG_SYS_ACQUIRE_SEMAPHORE => AcquireSemaphore {
                ack_handle: r.u32()?,
                semaphore_id: r.string_u8()?,
            },
            Opcode::MSG_SYS_RELEASE_SEMAPHORE => ReleaseSemaphore { ack_handle: r.u32()? },
            Opcode::MSG_SYS_CHECK_SEMAPHORE => CheckSemaphore {
                ack_handle: r.u32()?,
                semaphore_id: r.string_u8()?,
            },
            Opcode::MSG_SYS_OPERATE_REGISTER => {
                let ack_handle = r.u32()?;
                let register_id = r.u32()?;
                let fixed_zero = r.u16()?;
                if fixed_zero != 0 {
                    return Err(ChannelError::protocol(format!(
                        "expected fixed zero in operate register, got {}",
                        fixed_zero
                    )));
                }
                let size = r.u16()? as usize;
                OperateRegister {
                    ack_handle,
                    register_id,
                    payload: Bytes::copy_from_slice(r.bytes(size)?),
                }
            }
            Opcode::MSG_SYS_LOAD_REGISTER => {
                let ack_handle = r.u32()?;
                let register_id = r.u32()?;
                let values = r.u8()?;
                let zero0 = r.u16()?;
                let zero1 = r.u8()?;
                if zero0 != 0 || zero1 != 0 {
                    return Err(ChannelError::protocol(format!(
                        "expected fixed zeros in load register, got {} {}",
                        zero0, zero1
                    )));
                }
                LoadRegister { ack_handle, register_id, values }
            }
            Opcode::MSG_SYS_NOTIFY_REGISTER => NotifyRegister { register_id: r.u32()? },
            Opcode::MSG_SYS_CREATE_OBJECT => CreateObject {
                ack_handle: r.u32()?,
                x: r.f32()?,
                y: r.f32()?,
                z: r.f32()?,
                unk: r.u32()?,
            },
            Opcode::MSG_SYS_DELETE_OBJECT => DeleteObject { object_id: r.u32()? },
            Opcode::MSG_SYS_POSITION_OBJECT => PositionObject {
                object_id: r.u32()?,
                x: r.f32()?,
                y: r.f32()?,
                z: r.f32()?,
            },
            Opcode::MSG_SYS_DUPLICATE_OBJECT => DuplicateObject {
                object_id: r.u32()?,
                x: r.f32()?,
                y: r.f32()?,
                z: r.f32()?,
                unk: r.u32()?,
                owner_char_id: r.u32()?,
            },
            Opcode::MSG_SYS_CLEANUP_OBJECT => CleanupObject,
            Opcode::MSG_SYS_INSERT_USER => InsertUser { char_id: r.u32()? },
            Opcode::MSG_SYS_DELETE_USER => DeleteUser { char_id: r.u32()? },
            Opcode::MSG_SYS_NOTIFY_USER_BINARY => NotifyUserBinary {
                char_id: r.u32()?,
                binary_type: r.u8()?,
            },
            other => {
                return Err(ChannelError::protocol(format!("no parser for {}", other)));
            }
        };
        Ok(packet)
    }

    /// Write the payload (without the opcode)
    pub fn build(&self, w: &mut FrameWriter) {
        use Packet::*;
        match self {
            End | Nop | ExtendThreshold | StageDestruct | LeaveStage | UnreserveStage
            | CleanupObject => {}
            Ack(ack) => ack.build(w),
            TerminalLog { ack_handle, log_id, entries } => {
                w.u32(*ack_handle).u32(*log_id).u16(entries.len() as u16).u16(0);
                for entry in entries {
                    for field in entry {
                        w.u32(*field);
                    }
                }
            }
            Login {
                ack_handle,
                char_id,
                login_token_number,
                request_version,
                token,
            } => {
                let mut raw = [0u8; 17];
                let n = token.len().min(17);
                raw[..n].copy_from_slice(&token.as_bytes()[..n]);
                w.u32(*ack_handle)
                    .u32(*char_id)
                    .u32(*login_token_number)
                    .u16(0)
                    .u16(*request_version)
                    .u32(*char_id)
                    .u16(0)
                    .u16(0x11)
                    .bytes(&raw);
            }
            Logout { logout_type } => {
                w.u8(*logout_type);
            }
            Ping { ack_handle } | BackStage { ack_handle } | ReleaseSemaphore { ack_handle } => {
                w.u32(*ack_handle);
            }
            Time { get_remote_time, timestamp } => {
                w.bool(*get_remote_time).u32(*timestamp);
            }
            CastBinary {
                unk,
                broadcast_type,
                message_type,
                payload,
            } => {
                w.u32(*unk)
                    .u8(*broadcast_type)
                    .u8(*message_type)
                    .u16(payload.len() as u16)
                    .bytes(payload);
            }
            CastedBinary {
                char_id,
                broadcast_type,
                message_type,
                payload,
            } => {
                w.u32(*char_id)
                    .u8(*broadcast_type)
                    .u8(*message_type)
                    .u16(payload.len() as u16)
                    .bytes(payload);
            }
            CreateStage {
                ack_handle,
                unk,
                player_count,
                stage_id,
            } => {
                w.u32(*ack_handle).u8(*unk).u8(*player_count);
                write_id(w, stage_id);
            }
            EnterStage { ack_handle, unk, stage_id } | MoveStage { ack_handle, unk, stage_id } => {
                w.u32(*ack_handle).u8(*unk);
                write_id(w, stage_id);
            }
            LockStage {
                ack_handle,
                unk0,
                unk1,
                stage_id,
            } => {
                w.u32(*ack_handle).u8(*unk0).u8(*unk1);
                write_id(w, stage_id);
            }
            UnlockStage { unk } => {
                w.u16(*unk);
            }
            ReserveStage { ack_handle, ready, stage_id } => {
                w.u32(*ack_handle).u8(*ready);
                write_id(w, stage_id);
            }
            SetStagePass { unk, password } => {
                w.u8(*unk);
                write_id(w, password);
            }
            WaitStageBinary {
                ack_handle,
                binary_type0,
                binary_type1,
                unk,
                stage_id,
            }
            | GetStageBinary {
                ack_handle,
                binary_type0,
                binary_type1,
                unk,
                stage_id,
            } => {
                w.u32(*ack_handle).u8(*binary_type0).u8(*binary_type1).u32(*unk);
                write_id(w, stage_id);
            }
            SetStageBinary {
                binary_type0,
                binary_type1,
                stage_id,
                payload,
            } => {
                w.u8(*binary_type0)
                    .u8(*binary_type1)
                    .u8(stage_id.len() as u8 + 1)
                    .u16(payload.len() as u16)
                    .bytes(stage_id.as_bytes())
                    .u8(0)
                    .bytes(payload);
            }
            EnumerateClient {
                ack_handle,
                unk,
                get_type,
                stage_id,
            } => {
                w.u32(*ack_handle).u8(*unk).u8(*get_type);
                write_id(w, stage_id);
            }
            EnumerateStage {
                ack_handle,
                unk,
                stage_prefix,
            } => {
                w.u32(*ack_handle).u8(*unk);
                write_id(w, stage_prefix);
            }
            CreateSemaphore {
                ack_handle,
                unk,
                semaphore_id,
            } => {
                w.u32(*ack_handle).u16(*unk);
                write_id(w, semaphore_id);
            }
            CreateAcquireSemaphore {
                ack_handle,
                unk,
                player_count,
                semaphore_id,
            } => {
                w.u32(*ack_handle).u16(*unk).u8(*player_count);
                write_id(w, semaphore_id);
            }
            DeleteSemaphore { ack_handle, semaphore_id } => {
                w.u32(*ack_handle).u32(*semaphore_id);
            }
            AcquireSemaphore { ack_handle, semaphore_id }
            | CheckSemaphore { ack_handle, semaphore_id } => {
                w.u32(*ack_handle);
                write_id(w, semaphore_id);
            }
            OperateRegister {
                ack_handle,
                register_id,
                payload,
            } => {
                w.u32(*ack_handle)
                    .u32(*register_id)
                    .u16(0)
                    .u16(payload.len() as u16)
                    .bytes(payload);
            }
            LoadRegister {
                ack_handle,
                register_id,
                values,
            } => {
                w.u32(*ack_handle).u32(*register_id).u8(*values).u16(0).u8(0);
            }
            NotifyRegister { register_id } => {
                w.u32(*register_id);
            }
            CreateObject { ack_handle, x, y, z, unk } => {
                w.u32(*ack_handle).f32(*x).f32(*y).f32(*z).u32(*unk);
            }
            DeleteObject { object_id } => {
                w.u32(*object_id);
            }
            PositionObject { object_id, x, y, z } => {
                w.u32(*object_id).f32(*x).f32(*y).f32(*z);
            }
            DuplicateObject {
                object_id,
                x,
                y,
                z,
                unk,
                owner_char_id,
            } => {
                w.u32(*object_id).f32(*x).f32(*y).f32(*z).u32(*unk).u32(*owner_char_id);
            }
            InsertUser { char_id } | DeleteUser { char_id } => {
                w.u32(*char_id);
            }
            NotifyUserBinary { char_id, binary_type } => {
                w.u32(*char_id).u8(*binary_type);
            }
        }
    }

    /// Append opcode and payload to `w`
    pub fn write_to(&self, w: &mut FrameWriter) {
        w.opcode(self.opcode());
        self.build(w);
    }

    /// Serialize as a standalone packet: opcode header plus payload
    pub fn to_bytes(&self) -> Bytes {
        let mut w = FrameWriter::new();
        self.write_to(&mut w);
        w.freeze()
    }
}

/// `u8` length (including terminator), bytes, NUL
fn write_id(w: &mut FrameWriter, id: &str) {
    w.pascal_u8(id);
}

/// Parse a single packet from the front of `data`, returning it and the unread tail
pub fn parse_one(data: &[u8]) -> Result<(Packet, &[u8])> {
    let mut r = FrameReader::new(data);
    let raw = r.u16()?;
    let opcode = Opcode::try_from(raw)
        .map_err(|op| ChannelError::protocol(format!("unknown opcode 0x{:04X}", op)))?;
    let packet = Packet::parse(opcode, &mut r)?;
    Ok((packet, r.rest()))
}

/// Parse every packet in a group, stopping at `MSG_SYS_END` or the end of data
pub fn parse_all(mut data: &[u8]) -> Result<Vec<Packet>> {
    let mut out = Vec::new();
    while data.len() >= 2 {
        let (packet, rest) = parse_one(data)?;
        if packet == Packet::End {
            break;
        }
        out.push(packet);
        data = rest;
    }
    Ok(out)
}
