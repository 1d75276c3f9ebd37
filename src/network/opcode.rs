//! Numeric opcodes of the system message set
//!
//! Values must match the client exactly. Only the opcodes the channel core
//! parses or emits are listed; everything else is an unknown opcode and ends
//! the current packet group.

use std::fmt;

macro_rules! opcodes {
    ($($name:ident = $value:expr),* $(,)?) => {
        /// Packet identifier carried as the first two bytes of every packet
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        #[allow(non_camel_case_types)]
        pub enum Opcode {
            $($name = $value),*
        }

        impl Opcode {
            /// Wire name, as used in packet traces
            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => stringify!($name)),*
                }
            }
        }

        impl TryFrom<u16> for Opcode {
            type Error = u16;

            fn try_from(value: u16) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok(Opcode::$name),)*
                    other => Err(other),
                }
            }
        }
    };
}

opcodes! {
    MSG_SYS_ADD_OBJECT = 0x0008,
    MSG_SYS_EXTEND_THRESHOLD = 0x000F,
    MSG_SYS_END = 0x0010,
    MSG_SYS_NOP = 0x0011,
    MSG_SYS_ACK = 0x0012,
    MSG_SYS_TERMINAL_LOG = 0x0013,
    MSG_SYS_LOGIN = 0x0014,
    MSG_SYS_LOGOUT = 0x0015,
    MSG_SYS_SET_STATUS = 0x0016,
    MSG_SYS_PING = 0x0017,
    MSG_SYS_CAST_BINARY = 0x0018,
    MSG_SYS_HIDE_CLIENT = 0x0019,
    MSG_SYS_TIME = 0x001A,
    MSG_SYS_CASTED_BINARY = 0x001B,
    MSG_SYS_ECHO = 0x001F,
    MSG_SYS_CREATE_STAGE = 0x0020,
    MSG_SYS_STAGE_DESTRUCT = 0x0021,
    MSG_SYS_ENTER_STAGE = 0x0022,
    MSG_SYS_BACK_STAGE = 0x0023,
    MSG_SYS_MOVE_STAGE = 0x0024,
    MSG_SYS_LEAVE_STAGE = 0x0025,
    MSG_SYS_LOCK_STAGE = 0x0026,
    MSG_SYS_UNLOCK_STAGE = 0x0027,
    MSG_SYS_RESERVE_STAGE = 0x0028,
    MSG_SYS_UNRESERVE_STAGE = 0x0029,
    MSG_SYS_SET_STAGE_PASS = 0x002A,
    MSG_SYS_WAIT_STAGE_BINARY = 0x002B,
    MSG_SYS_SET_STAGE_BINARY = 0x002C,
    MSG_SYS_GET_STAGE_BINARY = 0x002D,
    MSG_SYS_ENUMERATE_CLIENT = 0x002E,
    MSG_SYS_ENUMERATE_STAGE = 0x002F,
    MSG_SYS_CREATE_SEMAPHORE = 0x0035,
    MSG_SYS_CREATE_ACQUIRE_SEMAPHORE = 0x0036,
    MSG_SYS_DELETE_SEMAPHORE = 0x0037,
    MSG_SYS_ACQUIRE_SEMAPHORE = 0x0038,
    MSG_SYS_RELEASE_SEMAPHORE = 0x0039,
    MSG_SYS_LOCK_GLOBAL_SEMA = 0x003A,
    MSG_SYS_UNLOCK_GLOBAL_SEMA = 0x003B,
    MSG_SYS_CHECK_SEMAPHORE = 0x003C,
    MSG_SYS_OPERATE_REGISTER = 0x003D,
    MSG_SYS_LOAD_REGISTER = 0x003E,
    MSG_SYS_NOTIFY_REGISTER = 0x003F,
    MSG_SYS_CREATE_OBJECT = 0x0040,
    MSG_SYS_DELETE_OBJECT = 0x0041,
    MSG_SYS_POSITION_OBJECT = 0x0042,
    MSG_SYS_ROTATE_OBJECT = 0x0043,
    MSG_SYS_DUPLICATE_OBJECT = 0x0044,
    MSG_SYS_SET_OBJECT_BINARY = 0x0045,
    MSG_SYS_GET_OBJECT_BINARY = 0x0046,
    MSG_SYS_GET_OBJECT_OWNER = 0x0047,
    MSG_SYS_UPDATE_OBJECT_BINARY = 0x0048,
    MSG_SYS_CLEANUP_OBJECT = 0x0049,
    MSG_SYS_INSERT_USER = 0x0050,
    MSG_SYS_DELETE_USER = 0x0051,
    MSG_SYS_SET_USER_BINARY = 0x0052,
    MSG_SYS_GET_USER_BINARY = 0x0053,
    MSG_SYS_NOTIFY_USER_BINARY = 0x0054,
}

impl Opcode {
    /// Opcodes too chatty to trace even with message logging enabled
    pub fn is_noisy(self) -> bool {
        matches!(
            self,
            Opcode::MSG_SYS_END
                | Opcode::MSG_SYS_NOP
                | Opcode::MSG_SYS_PING
                | Opcode::MSG_SYS_TIME
                | Opcode::MSG_SYS_EXTEND_THRESHOLD
                | Opcode::MSG_SYS_POSITION_OBJECT
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<Opcode> for u16 {
    fn from(op: Opcode) -> u16 {
        op as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_values() {
        assert_eq!(Opcode::try_from(0x0010), Ok(Opcode::MSG_SYS_END));
        assert_eq!(Opcode::try_from(0x0022), Ok(Opcode::MSG_SYS_ENTER_STAGE));
        assert_eq!(Opcode::try_from(0x0036), Ok(Opcode::MSG_SYS_CREATE_ACQUIRE_SEMAPHORE));
        assert_eq!(u16::from(Opcode::MSG_SYS_ACK), 0x0012);
    }

    #[test]
    fn test_unknown_value_is_returned() {
        assert_eq!(Opcode::try_from(0xBEEF), Err(0xBEEF));
    }

    #[test]
    fn test_display_uses_wire_name() {
        assert_eq!(Opcode::MSG_SYS_BACK_STAGE.to_string(), "MSG_SYS_BACK_STAGE");
        assert!(Opcode::MSG_SYS_PING.is_noisy());
        assert!(!Opcode::MSG_SYS_ENTER_STAGE.is_noisy());
    }
}
