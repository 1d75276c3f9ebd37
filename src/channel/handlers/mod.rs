//! Packet dispatch
//!
//! A packet group is a run of concatenated packets. Each one is parsed into a
//! [`Packet`] and routed by an exhaustive `match` to the handler for its area.
//!
//! Error policy per packet:
//! - Capacity / State: failure ack (when the request has a handle), keep going
//! - Protocol: failure ack, drop the rest of the group
//! - Connection / Panic: propagate, the recv loop tears the session down

pub mod ack;
pub mod object;
pub mod register;
pub mod semaphore;
pub mod stage;
pub mod system;

use std::sync::Arc;

use bytes::Bytes;

use crate::channel::server::ChannelServer;
use crate::channel::session::Session;
use crate::error::{ChannelError, Result};
use crate::network::frame::FrameReader;
use crate::network::opcode::Opcode;
use crate::network::packet::Packet;

/// Handle every packet in one decrypted group
pub async fn handle_packet_group(
    server: &Arc<ChannelServer>,
    session: &Arc<Session>,
    group: Bytes,
) -> Result<()> {
    let mut data: &[u8] = &group;

    while data.len() >= 2 {
        let raw = u16::from_be_bytes([data[0], data[1]]);
        let opcode = match Opcode::try_from(raw) {
            Ok(op) => op,
            Err(raw) => {
                tracing::warn!(
                    "[{}] unknown opcode 0x{:04X}, dropping {} bytes",
                    session.peer,
                    raw,
                    data.len()
                );
                return Ok(());
            }
        };
        session.trace_inbound(opcode, data);

        let mut reader = FrameReader::new(&data[2..]);
        let packet = match Packet::parse(opcode, &mut reader) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("[{}] failed to parse {}: {}", session.peer, opcode, e);
                return Ok(());
            }
        };
        data = reader.rest();

        if let Packet::Logout { .. } = packet {
            session.request_close();
            return Ok(());
        }

        let ack_handle = packet.ack_handle();
        let wants_buffer = packet.wants_buffer_ack();

        match dispatch(server, session, packet).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!("[{}] {} failed: {}", session.peer, opcode, e);
                if let Some(handle) = ack_handle {
                    ack::failure(session, handle, wants_buffer, e.ack_code());
                }
                if matches!(e, ChannelError::Protocol { .. }) {
                    return Ok(());
                }
            }
        }
    }

    Ok(())
}

/// Route one packet to its handler
pub async fn dispatch(server: &Arc<ChannelServer>, session: &Arc<Session>, packet: Packet) -> Result<()> {
    use Packet::*;

    match packet {
        End | Nop | ExtendThreshold | Ack(_) => Ok(()),
        Logout { .. } => {
            session.request_close();
            Ok(())
        }

        // System
        TerminalLog { ack_handle, log_id, entries } => {
            system::terminal_log(session, ack_handle, log_id, &entries)
        }
        Login { ack_handle, char_id, .. } => system::login(server, session, ack_handle, char_id),
        Ping { ack_handle } => system::ping(session, ack_handle),
        Time { .. } => system::time(session),
        CastBinary {
            broadcast_type,
            message_type,
            payload,
            ..
        } => system::cast_binary(server, session, broadcast_type, message_type, payload),

        // Stages
        CreateStage {
            ack_handle,
            player_count,
            stage_id,
            ..
        } => stage::create_stage(server, session, ack_handle, player_count, &stage_id),
        EnterStage { ack_handle, stage_id, .. } => stage::enter_stage(server, session, ack_handle, &stage_id),
        MoveStage { ack_handle, stage_id, .. } => stage::move_stage(server, session, ack_handle, &stage_id),
        BackStage { ack_handle } => stage::back_stage(server, session, ack_handle),
        LeaveStage => stage::leave_stage(server, session),
        LockStage { ack_handle, stage_id, .. } => stage::lock_stage(server, session, ack_handle, &stage_id),
        UnlockStage { .. } => stage::unlock_stage(server, session),
        ReserveStage {
            ack_handle,
            ready,
            stage_id,
        } => stage::reserve_stage(server, session, ack_handle, ready, &stage_id),
        UnreserveStage => stage::unreserve_stage(server, session),
        SetStagePass { password, .. } => stage::set_stage_pass(server, session, &password),
        WaitStageBinary {
            ack_handle,
            binary_type0,
            binary_type1,
            stage_id,
            ..
        } => stage::wait_stage_binary(server, session, ack_handle, binary_type0, binary_type1, &stage_id).await,
        SetStageBinary {
            binary_type0,
            binary_type1,
            stage_id,
            payload,
        } => stage::set_stage_binary(server, binary_type0, binary_type1, &stage_id, payload),
        GetStageBinary {
            ack_handle,
            binary_type0,
            binary_type1,
            stage_id,
            ..
        } => stage::get_stage_binary(server, session, ack_handle, binary_type0, binary_type1, &stage_id),
        EnumerateClient {
            ack_handle,
            get_type,
            stage_id,
            ..
        } => stage::enumerate_client(server, session, ack_handle, get_type, &stage_id),
        EnumerateStage {
            ack_handle,
            stage_prefix,
            ..
        } => stage::enumerate_stage(server, session, ack_handle, &stage_prefix),

        // Semaphores
        CreateSemaphore { ack_handle, .. } => semaphore::create_semaphore(session, ack_handle),
        CreateAcquireSemaphore {
            ack_handle,
            player_count,
            semaphore_id,
            ..
        } => semaphore::create_acquire_semaphore(server, session, ack_handle, player_count, &semaphore_id),
        AcquireSemaphore { ack_handle, semaphore_id } => {
            semaphore::acquire_semaphore(server, session, ack_handle, &semaphore_id)
        }
        ReleaseSemaphore { ack_handle } => semaphore::release_semaphore(server, session, ack_handle),
        DeleteSemaphore { ack_handle, semaphore_id } => {
            semaphore::delete_semaphore(server, session, ack_handle, semaphore_id)
        }
        CheckSemaphore { ack_handle, semaphore_id } => {
            semaphore::check_semaphore(server, session, ack_handle, &semaphore_id)
        }

        // World-event registers
        OperateRegister {
            ack_handle,
            register_id,
            payload,
        } => register::operate_register(server, session, ack_handle, register_id, &payload),
        LoadRegister {
            ack_handle,
            register_id,
            values,
        } => register::load_register(server, session, ack_handle, register_id, values),

        // Objects
        CreateObject { ack_handle, x, y, z, .. } => object::create_object(server, session, ack_handle, x, y, z),
        PositionObject { object_id, x, y, z } => object::position_object(server, session, object_id, x, y, z),
        DeleteObject { object_id } => {
            tracing::debug!("[{}] ignoring client delete of object {:X}", session.peer, object_id);
            Ok(())
        }

        // Server-to-client only
        CastedBinary { .. }
        | StageDestruct
        | NotifyRegister { .. }
        | DuplicateObject { .. }
        | CleanupObject
        | InsertUser { .. }
        | DeleteUser { .. }
        | NotifyUserBinary { .. } => {
            tracing::debug!("[{}] ignoring server-bound copy of a server packet", session.peer);
            Ok(())
        }
    }
}
