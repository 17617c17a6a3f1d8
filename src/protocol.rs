//! Line protocol definitions
//!
//! Every message is one UTF-8 line. Server lines are fixed Russian literals
//! rendered through `Display`; client lines are either the exit command or
//! free text.

use std::fmt;

use crate::error::LoginError;
use crate::types::Username;

/// Exit command, matched case-insensitively after trimming
pub const EXIT_COMMAND: &str = "/exit";

/// Server → Client line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Sent immediately after accept
    LoginPrompt,
    /// First line was blank; connection closes afterwards
    EmptyUsername,
    /// Username held by another session; connection closes afterwards
    UsernameTaken,
    /// Login accepted
    Welcome { username: Username },
    /// Broadcast when a session completes login
    UserJoined { username: Username },
    /// Broadcast relay of a client line
    Chat { from: Username, text: String },
    /// Broadcast when a registered session tears down
    UserLeft { username: Username },
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMessage::LoginPrompt => f.write_str("Введите логин:"),
            ServerMessage::EmptyUsername => {
                f.write_str("Логин не может быть пустым. Соединение будет закрыто.")
            }
            ServerMessage::UsernameTaken => f.write_str("Логин занят. Соединение будет закрыто."),
            ServerMessage::Welcome { username } => write!(f, "Добро пожаловать, {}!", username),
            ServerMessage::UserJoined { username } => {
                write!(f, "Сервер: Пользователь {} присоединился к чату!", username)
            }
            ServerMessage::Chat { from, text } => write!(f, "{}: {}", from, text),
            ServerMessage::UserLeft { username } => {
                write!(f, "Сервер: Пользователь {} покинул чат.", username)
            }
        }
    }
}

/// Convert a login rejection into the line sent before closing
impl From<LoginError> for ServerMessage {
    fn from(err: LoginError) -> Self {
        match err {
            LoginError::EmptyUsername => ServerMessage::EmptyUsername,
            LoginError::UsernameTaken(_) => ServerMessage::UsernameTaken,
        }
    }
}

/// Client → Server line received while the session is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientLine<'a> {
    /// Explicit disconnect request
    Exit,
    /// Anything else, kept verbatim
    Text(&'a str),
}

impl<'a> ClientLine<'a> {
    pub fn parse(line: &'a str) -> Self {
        if line.trim().eq_ignore_ascii_case(EXIT_COMMAND) {
            ClientLine::Exit
        } else {
            ClientLine::Text(line)
        }
    }
}
