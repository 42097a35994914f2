use ballast::error::{DecodeError, Error, Result};

/// A protocol command, one variant per wire tag.
///
/// Encoding is the tag, then each field preceded by one `\r`, closed by
/// `\n`. Fields travel verbatim with no escaping, so bodies must not
/// contain raw `\r` or `\n`; a `\r` smuggled into a field changes the
/// receiver-side argument count and the line decodes to
/// `unexpected_argument`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say { room_id: String, text: String },
    Nick { nick: String },
    Response { text: String },
    Login { id: String, pw: String },
    Register { id: String, pw: String },
    FriendRequest { to_user_id: String },
    FriendAccept { from_user_id: String },
    FriendReject { from_user_id: String },
    FriendRemove { friend_user_id: String },
    ListFriend,
    ListFriendRequest,
    CreateRoom { room_name: String },
    DeleteRoom { room_id: String },
    InviteRoom { room_id: String, friend_user_id: String },
    LeaveRoom { room_id: String },
    ListRoom,
    History { room_id: String, limit: String },
}

impl Command {
    /// Wire tag naming this command.
    pub fn tag(&self) -> &'static str {
        match self {
            Command::Say { .. } => "say",
            Command::Nick { .. } => "nick",
            Command::Response { .. } => "response",
            Command::Login { .. } => "login",
            Command::Register { .. } => "register",
            Command::FriendRequest { .. } => "friend_request",
            Command::FriendAccept { .. } => "friend_accept",
            Command::FriendReject { .. } => "friend_reject",
            Command::FriendRemove { .. } => "friend_remove",
            Command::ListFriend => "list_friend",
            Command::ListFriendRequest => "list_friend_request",
            Command::CreateRoom { .. } => "create_room",
            Command::DeleteRoom { .. } => "delete_room",
            Command::InviteRoom { .. } => "invite_room",
            Command::LeaveRoom { .. } => "leave_room",
            Command::ListRoom => "list_room",
            Command::History { .. } => "history",
        }
    }

    /// Number of wire arguments this command carries.
    pub fn arity(&self) -> usize {
        match self {
            Command::ListFriend | Command::ListFriendRequest | Command::ListRoom => 0,
            Command::Nick { .. }
            | Command::Response { .. }
            | Command::FriendRequest { .. }
            | Command::FriendAccept { .. }
            | Command::FriendReject { .. }
            | Command::FriendRemove { .. }
            | Command::CreateRoom { .. }
            | Command::DeleteRoom { .. }
            | Command::LeaveRoom { .. } => 1,
            Command::Say { .. }
            | Command::Login { .. }
            | Command::Register { .. }
            | Command::InviteRoom { .. }
            | Command::History { .. } => 2,
        }
    }

    /// Convenience constructor for the most common server reply.
    #[inline]
    pub fn response<T: Into<String>>(text: T) -> Command {
        Command::Response { text: text.into() }
    }
}

/// Encodes a command as one wire line including the `\n` terminator.
pub fn encode(cmd: &Command) -> String {
    let mut out = String::from(cmd.tag());

    let mut push = |field: &str| {
        out.push('\r');
        out.push_str(field);
    };

    match cmd {
        Command::Say { room_id, text } => {
            push(room_id);
            push(text);
        }
        Command::Nick { nick } => push(nick),
        Command::Response { text } => push(text),
        Command::Login { id, pw } | Command::Register { id, pw } => {
            push(id);
            push(pw);
        }
        Command::FriendRequest { to_user_id } => push(to_user_id),
        Command::FriendAccept { from_user_id } | Command::FriendReject { from_user_id } => {
            push(from_user_id)
        }
        Command::FriendRemove { friend_user_id } => push(friend_user_id),
        Command::CreateRoom { room_name } => push(room_name),
        Command::DeleteRoom { room_id } | Command::LeaveRoom { room_id } => push(room_id),
        Command::InviteRoom {
            room_id,
            friend_user_id,
        } => {
            push(room_id);
            push(friend_user_id);
        }
        Command::History { room_id, limit } => {
            push(room_id);
            push(limit);
        }
        Command::ListFriend | Command::ListFriendRequest | Command::ListRoom => {}
    }

    out.push('\n');
    out
}

fn split_line(line: &str) -> (Option<&str>, Vec<&str>) {
    let mut tag = None;
    let mut args = Vec::new();

    for token in line.split('\r') {
        if token.is_empty() {
            continue;
        }
        if tag.is_none() {
            tag = Some(token);
        } else {
            args.push(token);
        }
    }

    (tag, args)
}

fn expect_arity<'a>(args: &'a [&'a str], n: usize) -> Result<&'a [&'a str]> {
    if args.len() != n {
        return Err(Error::Decode(DecodeError::UnexpectedArgument));
    }
    Ok(args)
}

/// Decodes one line, with or without its trailing `\n`.
pub fn decode(line: &str) -> Result<Command> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    if line.is_empty() {
        return Err(Error::Decode(DecodeError::EmptyLine));
    }

    let (tag, args) = split_line(line);
    let tag = match tag {
        Some(tag) => tag,
        None => return Err(Error::Decode(DecodeError::EmptyLine)),
    };

    let cmd = match tag {
        "say" => {
            let args = expect_arity(&args, 2)?;
            Command::Say {
                room_id: args[0].to_owned(),
                text: args[1].to_owned(),
            }
        }
        "nick" => Command::Nick {
            nick: expect_arity(&args, 1)?[0].to_owned(),
        },
        "response" => Command::Response {
            text: expect_arity(&args, 1)?[0].to_owned(),
        },
        "login" => {
            let args = expect_arity(&args, 2)?;
            Command::Login {
                id: args[0].to_owned(),
                pw: args[1].to_owned(),
            }
        }
        "register" => {
            let args = expect_arity(&args, 2)?;
            Command::Register {
                id: args[0].to_owned(),
                pw: args[1].to_owned(),
            }
        }
        "friend_request" => Command::FriendRequest {
            to_user_id: expect_arity(&args, 1)?[0].to_owned(),
        },
        "friend_accept" => Command::FriendAccept {
            from_user_id: expect_arity(&args, 1)?[0].to_owned(),
        },
        "friend_reject" => Command::FriendReject {
            from_user_id: expect_arity(&args, 1)?[0].to_owned(),
        },
        "friend_remove" => Command::FriendRemove {
            friend_user_id: expect_arity(&args, 1)?[0].to_owned(),
        },
        "list_friend" => {
            expect_arity(&args, 0)?;
            Command::ListFriend
        }
        "list_friend_request" => {
            expect_arity(&args, 0)?;
            Command::ListFriendRequest
        }
        "create_room" => Command::CreateRoom {
            room_name: expect_arity(&args, 1)?[0].to_owned(),
        },
        "delete_room" => Command::DeleteRoom {
            room_id: expect_arity(&args, 1)?[0].to_owned(),
        },
        "invite_room" => {
            let args = expect_arity(&args, 2)?;
            Command::InviteRoom {
                room_id: args[0].to_owned(),
                friend_user_id: args[1].to_owned(),
            }
        }
        "leave_room" => Command::LeaveRoom {
            room_id: expect_arity(&args, 1)?[0].to_owned(),
        },
        "list_room" => {
            expect_arity(&args, 0)?;
            Command::ListRoom
        }
        "history" => {
            let args = expect_arity(&args, 2)?;
            Command::History {
                room_id: args[0].to_owned(),
                limit: args[1].to_owned(),
            }
        }
        _ => return Err(Error::Decode(DecodeError::InvalidCommand)),
    };

    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<Command> {
        vec![
            Command::Say {
                room_id: "1".into(),
                text: "hello there".into(),
            },
            Command::Nick { nick: "ishmael".into() },
            Command::response("login success"),
            Command::Login {
                id: "alice".into(),
                pw: "pw".into(),
            },
            Command::Register {
                id: "bob".into(),
                pw: "pw".into(),
            },
            Command::FriendRequest {
                to_user_id: "bob".into(),
            },
            Command::FriendAccept {
                from_user_id: "alice".into(),
            },
            Command::FriendReject {
                from_user_id: "mallory".into(),
            },
            Command::FriendRemove {
                friend_user_id: "bob".into(),
            },
            Command::ListFriend,
            Command::ListFriendRequest,
            Command::CreateRoom {
                room_name: "lobby".into(),
            },
            Command::DeleteRoom { room_id: "3".into() },
            Command::InviteRoom {
                room_id: "1".into(),
                friend_user_id: "bob".into(),
            },
            Command::LeaveRoom { room_id: "1".into() },
            Command::ListRoom,
            Command::History {
                room_id: "1".into(),
                limit: "50".into(),
            },
        ]
    }

    #[test]
    fn test_roundtrip_every_variant() {
        for cmd in all_variants() {
            let wire = encode(&cmd);
            assert_eq!(decode(&wire).unwrap(), cmd, "roundtrip failed for {}", cmd.tag());
        }
    }

    #[test]
    fn test_encode_shape() {
        for cmd in all_variants() {
            let wire = encode(&cmd);
            assert!(wire.ends_with('\n'));
            assert_eq!(wire.matches('\n').count(), 1, "{}", cmd.tag());
            assert_eq!(wire.matches('\r').count(), cmd.arity(), "{}", cmd.tag());
        }
    }

    #[test]
    fn test_encode_say_wire_format() {
        let wire = encode(&Command::Say {
            room_id: "1".into(),
            text: "hello".into(),
        });
        assert_eq!(wire, "say\r1\rhello\n");
    }

    #[test]
    fn test_decode_without_terminator() {
        assert_eq!(
            decode("nick\rishmael").unwrap(),
            Command::Nick { nick: "ishmael".into() }
        );
    }

    #[test]
    fn test_decode_empty_line() {
        assert_eq!(decode("\n").unwrap_err(), Error::Decode(DecodeError::EmptyLine));
        assert_eq!(decode("").unwrap_err(), Error::Decode(DecodeError::EmptyLine));
        // A line of bare separators carries no tokens at all.
        assert_eq!(decode("\r\r\n").unwrap_err(), Error::Decode(DecodeError::EmptyLine));
    }

    #[test]
    fn test_decode_unknown_tag() {
        assert_eq!(
            decode("teleport\rhome\n").unwrap_err(),
            Error::Decode(DecodeError::InvalidCommand)
        );
        assert_eq!(
            decode("teleport\n").unwrap_err(),
            Error::Decode(DecodeError::InvalidCommand)
        );
    }

    #[test]
    fn test_decode_arity_mismatch() {
        assert_eq!(
            decode("say\n").unwrap_err(),
            Error::Decode(DecodeError::UnexpectedArgument)
        );
        assert_eq!(
            decode("say\r1\n").unwrap_err(),
            Error::Decode(DecodeError::UnexpectedArgument)
        );
        assert_eq!(
            decode("list_friend\rextra\n").unwrap_err(),
            Error::Decode(DecodeError::UnexpectedArgument)
        );
    }

    #[test]
    fn test_separator_in_body_shifts_arity() {
        // The framing has no escape: a \r inside a body splits into an
        // extra argument and the line is rejected.
        assert_eq!(
            decode("say\r1\rline_with_\r_in_body\n").unwrap_err(),
            Error::Decode(DecodeError::UnexpectedArgument)
        );
    }

    #[test]
    fn test_empty_tokens_are_skipped() {
        assert_eq!(
            decode("nick\r\rishmael\n").unwrap(),
            Command::Nick { nick: "ishmael".into() }
        );
    }
}
