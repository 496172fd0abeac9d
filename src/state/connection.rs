//! Connection startup and authentication step-sequence.

use crate::error::{Error, Result};
use crate::opts::{Opts, SslMode};
use crate::pgconn::{Frame, PgConn};
use crate::protocol::backend::{
    AuthenticationMessage, BackendKeyData, ErrorResponse, msg_type,
};
use crate::protocol::frontend::auth::{SCRAM_SHA_256, ScramClient, md5_password};
use crate::protocol::frontend::{
    write_password, write_sasl_initial_response, write_sasl_response, write_ssl_request,
    write_startup,
};

use super::action::{Ready, Step, Wait};
use super::{PgGen, flush_step};

/// Connection state during startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initial,
    WaitingSslResponse,
    WaitingAuth,
    WaitingReady,
    Ready,
}

/// Drive the startup handshake up to the first ReadyForQuery.
pub struct Connect {
    state: ConnectionState,
    opts: Opts,
    scram: Option<ScramClient>,
}

impl Connect {
    pub fn new(opts: &Opts) -> Self {
        Self {
            state: ConnectionState::Initial,
            opts: opts.clone(),
            scram: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn write_startup_message(&self, buf: &mut Vec<u8>) {
        let mut params = vec![
            ("user", self.opts.user.as_str()),
            ("client_encoding", "UTF8"),
        ];
        if let Some(db) = &self.opts.database {
            params.push(("database", db.as_str()));
        }
        if let Some(app) = &self.opts.application_name {
            params.push(("application_name", app.as_str()));
        }
        for (name, value) in &self.opts.params {
            params.push((name.as_str(), value.as_str()));
        }
        write_startup(buf, &params);
    }

    fn password(&self) -> Result<&str> {
        self.opts
            .password
            .as_deref()
            .ok_or_else(|| Error::Auth("password required but not provided".into()))
    }

    fn handle_auth(&mut self, pgconn: &mut PgConn, frame: &Frame) -> Result<()> {
        match AuthenticationMessage::parse(&frame.payload)? {
            AuthenticationMessage::Ok => {
                self.state = ConnectionState::WaitingReady;
            }
            AuthenticationMessage::CleartextPassword => {
                let password = self.password()?.to_string();
                write_password(pgconn.write_buf_mut(), &password);
            }
            AuthenticationMessage::Md5Password { salt } => {
                let hashed = md5_password(&self.opts.user, self.password()?, &salt);
                write_password(pgconn.write_buf_mut(), &hashed);
            }
            AuthenticationMessage::Sasl { mechanisms } => {
                if !mechanisms.contains(&SCRAM_SHA_256) {
                    return Err(Error::NotSupported(format!(
                        "SASL mechanisms {:?}",
                        mechanisms
                    )));
                }
                let scram = ScramClient::new(self.password()?);
                write_sasl_initial_response(
                    pgconn.write_buf_mut(),
                    SCRAM_SHA_256,
                    scram.client_first_message().as_bytes(),
                );
                self.scram = Some(scram);
            }
            AuthenticationMessage::SaslContinue { data } => {
                let scram = self
                    .scram
                    .as_mut()
                    .ok_or_else(|| Error::Protocol("SASLContinue without SASL".into()))?;
                let server_first = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("invalid server-first-message: {e}")))?;
                let client_final = scram.process_server_first(server_first)?;
                write_sasl_response(pgconn.write_buf_mut(), client_final.as_bytes());
            }
            AuthenticationMessage::SaslFinal { data } => {
                let scram = self
                    .scram
                    .as_ref()
                    .ok_or_else(|| Error::Protocol("SASLFinal without SASL".into()))?;
                let server_final = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("invalid server-final-message: {e}")))?;
                scram.verify_server_final(server_final)?;
            }
            AuthenticationMessage::Other(code) => {
                return Err(Error::NotSupported(format!(
                    "authentication method {}",
                    code
                )));
            }
        }
        Ok(())
    }
}

impl PgGen for Connect {
    type Output = ();

    fn resume(&mut self, pgconn: &mut PgConn, _ready: Ready) -> Result<Step<()>> {
        if self.state == ConnectionState::Initial {
            if self.opts.ssl_mode == SslMode::Disable {
                self.write_startup_message(pgconn.write_buf_mut());
                self.state = ConnectionState::WaitingAuth;
            } else {
                write_ssl_request(pgconn.write_buf_mut());
                self.state = ConnectionState::WaitingSslResponse;
            }
        }

        if self.state == ConnectionState::WaitingSslResponse {
            if let Some(wait) = flush_step(pgconn)? {
                return Ok(Step::Wait(wait));
            }
            pgconn.consume_input()?;
            match pgconn.take_ssl_response() {
                None if pgconn.is_eof() => return Err(Error::ConnectionBroken),
                None => return Ok(Step::Wait(Wait::R)),
                Some(b'S') => {
                    return Err(Error::NotSupported(
                        "server accepted SSL but this driver has no TLS support".into(),
                    ));
                }
                Some(b'N') if self.opts.ssl_mode == SslMode::Require => {
                    return Err(Error::Auth(
                        "SSL required but not supported by server".into(),
                    ));
                }
                Some(b'N') => {
                    self.write_startup_message(pgconn.write_buf_mut());
                    self.state = ConnectionState::WaitingAuth;
                }
                Some(other) => {
                    return Err(Error::Protocol(format!(
                        "Unexpected SSL response: {}",
                        other
                    )));
                }
            }
        }

        flush_step(pgconn)?;
        pgconn.fill()?;
        while let Some(frame) = pgconn.next_frame()? {
            match frame.type_byte {
                msg_type::AUTHENTICATION => self.handle_auth(pgconn, &frame)?,
                msg_type::BACKEND_KEY_DATA => {
                    let key = *BackendKeyData::parse(&frame.payload)?;
                    pgconn.set_backend_key(key);
                }
                msg_type::READY_FOR_QUERY if self.state == ConnectionState::WaitingReady => {
                    self.state = ConnectionState::Ready;
                    return Ok(Step::Done(()));
                }
                msg_type::ERROR_RESPONSE => {
                    return Err(ErrorResponse::parse(&frame.payload)?.into_error());
                }
                msg_type::NEGOTIATE_PROTOCOL_VERSION => {
                    tracing::debug!("server negotiated protocol version down");
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "Unexpected message '{}' during startup in state {:?}",
                        other as char, self.state
                    )));
                }
            }
        }

        match flush_step(pgconn)? {
            Some(wait) => Ok(Step::Wait(wait)),
            None => Ok(Step::Wait(Wait::R)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pgconn::tests::{frame, pair};
    use std::io::{Read, Write};

    fn auth(code: i32, extra: &[u8]) -> Vec<u8> {
        let mut payload = code.to_be_bytes().to_vec();
        payload.extend_from_slice(extra);
        frame(b'R', &payload)
    }

    fn opts() -> Opts {
        Opts {
            user: "alice".into(),
            password: Some("pw".into()),
            ..Opts::default()
        }
    }

    #[test]
    fn test_cleartext_startup() {
        let (mut pgconn, mut server) = pair();
        let mut connect = Connect::new(&opts());

        assert!(matches!(
            connect.resume(&mut pgconn, Ready::NONE).unwrap(),
            Step::Wait(Wait::R)
        ));
        let mut len = [0u8; 4];
        server.read_exact(&mut len).unwrap();
        let mut startup = vec![0u8; i32::from_be_bytes(len) as usize - 4];
        server.read_exact(&mut startup).unwrap();
        assert!(startup.windows(6).any(|w| w == b"alice\0"));

        server.write_all(&auth(3, b"")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let _ = connect.resume(&mut pgconn, Ready::R).unwrap();
        let mut header = [0u8; 5];
        server.read_exact(&mut header).unwrap();
        assert_eq!(header[0], b'p');
        let mut password = [0u8; 3];
        server.read_exact(&mut password).unwrap();
        assert_eq!(&password, b"pw\0");

        let mut reply = auth(0, b"");
        let mut key = 77_u32.to_be_bytes().to_vec();
        key.extend_from_slice(&5_u32.to_be_bytes());
        reply.extend(frame(b'K', &key));
        reply.extend(frame(b'S', b"server_version\016.2\0"));
        reply.extend(frame(b'Z', b"I"));
        server.write_all(&reply).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));

        assert!(matches!(
            connect.resume(&mut pgconn, Ready::R).unwrap(),
            Step::Done(())
        ));
        assert_eq!(connect.state(), ConnectionState::Ready);
        assert_eq!(pgconn.backend_key().map(|k| k.process_id()), Some(77));
        assert_eq!(pgconn.server_param("server_version"), Some("16.2"));
    }

    #[test]
    fn test_ssl_accepted_is_not_supported() {
        let (mut pgconn, mut server) = pair();
        let mut connect = Connect::new(&Opts {
            ssl_mode: SslMode::Prefer,
            ..opts()
        });
        let _ = connect.resume(&mut pgconn, Ready::NONE).unwrap();
        let mut request = [0u8; 8];
        server.read_exact(&mut request).unwrap();
        server.write_all(b"S").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(matches!(
            connect.resume(&mut pgconn, Ready::R),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn test_startup_error() {
        let (mut pgconn, mut server) = pair();
        let mut connect = Connect::new(&opts());
        let _ = connect.resume(&mut pgconn, Ready::NONE).unwrap();
        server
            .write_all(&frame(b'E', b"SFATAL\0C28P01\0Mpassword authentication failed\0\0"))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let err = connect.resume(&mut pgconn, Ready::R).unwrap_err();
        assert_eq!(err.sqlstate(), Some("28P01"));
        assert!(err.is_connection_broken());
    }
}
