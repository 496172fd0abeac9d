//! Extended query protocol messages.
//!
//! Pipelined commands are sent as unnamed Parse/Bind/Describe/Execute
//! groups without parameters, with results in text format.

use crate::protocol::codec::MessageBuilder;

/// Describe target for a portal.
const DESCRIBE_PORTAL: u8 = b'P';

/// Write a Parse message for the unnamed statement.
pub fn write_parse(buf: &mut Vec<u8>, query: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PARSE);
    msg.write_cstr("");
    msg.write_cstr(query);
    msg.write_i16(0);
    msg.finish();
}

/// Write a Bind message binding the unnamed statement to the unnamed portal.
///
/// No parameters are sent and all result columns use the text format.
pub fn write_bind(buf: &mut Vec<u8>) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::BIND);
    msg.write_cstr("");
    msg.write_cstr("");
    msg.write_i16(0);
    msg.write_i16(0);
    msg.write_i16(0);
    msg.finish();
}

/// Write a Describe message for the unnamed portal.
pub fn write_describe_portal(buf: &mut Vec<u8>) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::DESCRIBE);
    msg.write_u8(DESCRIBE_PORTAL);
    msg.write_cstr("");
    msg.finish();
}

/// Write an Execute message for the unnamed portal with no row limit.
pub fn write_execute(buf: &mut Vec<u8>) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::EXECUTE);
    msg.write_cstr("");
    msg.write_i32(0);
    msg.finish();
}

/// Write a Flush message.
///
/// Asks the server to deliver the replies produced so far without ending
/// the implicit transaction.
pub fn write_flush(buf: &mut Vec<u8>) {
    let msg = MessageBuilder::new(buf, super::msg_type::FLUSH);
    msg.finish();
}

/// Write a Sync message.
///
/// Closes the current implicit transaction segment and makes the server
/// answer with ReadyForQuery.
pub fn write_sync(buf: &mut Vec<u8>) {
    let msg = MessageBuilder::new(buf, super::msg_type::SYNC);
    msg.finish();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync() {
        let mut buf = Vec::new();
        write_sync(&mut buf);
        assert_eq!(buf, [b'S', 0, 0, 0, 4]);
    }

    #[test]
    fn test_parse_bind_execute_sequence() {
        let mut buf = Vec::new();
        write_parse(&mut buf, "SELECT 1");
        write_bind(&mut buf);
        write_describe_portal(&mut buf);
        write_execute(&mut buf);

        assert_eq!(buf[0], b'P');
        // name "", query, param count
        let parse_len = 4 + 1 + 9 + 2;
        assert_eq!(&buf[1..5], &(parse_len as i32).to_be_bytes());
        let bind = &buf[1 + parse_len..];
        assert_eq!(bind[0], b'B');
        assert_eq!(&bind[1..5], &12_i32.to_be_bytes());
        let describe = &bind[13..];
        assert_eq!(&describe[..7], &[b'D', 0, 0, 0, 6, b'P', 0]);
        let execute = &describe[7..];
        assert_eq!(execute, &[b'E', 0, 0, 0, 9, 0, 0, 0, 0, 0]);
    }
}
