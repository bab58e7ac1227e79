use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
};

use base64::prelude::*;
use hickory_proto::{
    op::{Message, MessageType, OpCode, ResponseCode},
    rr::{rdata::TXT, DNSClass, Name, RData, Record, RecordType},
};
use sha2::{Digest as _, Sha256};
use tokio::{net::UdpSocket, sync::oneshot, task::JoinHandle};

use super::{Answer, ValidatorError};
use crate::api::ChallengeResponse;

const TXT_TTL: u32 = 600;

/// The TXT record content for a key authorization: unpadded base64 of its SHA-256.
pub fn dns_txt_value(key_authorization: &str) -> String {
    BASE64_STANDARD_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}

/// Answers TXT queries for `_acme-challenge.{domain}` over UDP.
#[derive(Debug)]
pub struct Dns01Validator {
    name: Name,
    txt: String,
    port: u16,
    running: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
}

impl Dns01Validator {
    pub fn new(
        domain: &str,
        response: &ChallengeResponse,
        port: u16,
    ) -> Result<Self, ValidatorError> {
        let answer = Answer::from_response("dns-01", response)?;

        let name = Name::from_ascii(format!("_acme-challenge.{domain}."))
            .map_err(|err| ValidatorError::MalformedChallenge(err.to_string()))?;

        Ok(Dns01Validator {
            name,
            txt: dns_txt_value(&answer.key_authorization),
            port,
            running: None,
        })
    }

    pub async fn start(&mut self) -> io::Result<SocketAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.port)).await?;
        let addr = socket.local_addr()?;

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let name = self.name.clone();
        let txt = self.txt.clone();

        let task = tokio::spawn(async move {
            let mut buf = [0; 512];

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,

                    received = socket.recv_from(&mut buf) => {
                        let (len, peer) = match received {
                            Ok(received) => received,
                            Err(err) => {
                                log::warn!("dns-01 receive failed: {err}");
                                continue;
                            }
                        };

                        let reply = match respond(&buf[..len], &name, &txt).to_vec() {
                            Ok(reply) => reply,
                            Err(err) => {
                                log::warn!("dns-01 reply encoding failed: {err}");
                                continue;
                            }
                        };

                        if let Err(err) = socket.send_to(&reply, peer).await {
                            log::warn!("dns-01 reply to {peer} failed: {err}");
                        }
                    }
                }
            }
        });

        self.running = Some((stop_tx, task));

        log::debug!("dns-01 validator for {} listening on {addr}", self.name);
        Ok(addr)
    }

    pub async fn stop(&mut self) {
        if let Some((stop_tx, task)) = self.running.take() {
            let _ = stop_tx.send(());
            let _ = task.await;
        }
    }
}

fn respond(packet: &[u8], name: &Name, txt: &str) -> Message {
    let Ok(request) = Message::from_vec(packet) else {
        return Message::error_msg(0, OpCode::Query, ResponseCode::FormErr);
    };

    let Some(query) = request.queries().first().cloned() else {
        return Message::error_msg(request.id(), request.op_code(), ResponseCode::FormErr);
    };

    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_authoritative(true);

    let matches = query.name() == name
        && query.query_type() == RecordType::TXT
        && query.query_class() == DNSClass::IN;

    if matches {
        response.set_response_code(ResponseCode::NoError);
        response.add_answer(Record::from_rdata(
            query.name().clone(),
            TXT_TTL,
            RData::TXT(TXT::new(vec![txt.to_owned()])),
        ));
    } else {
        response.set_response_code(ResponseCode::NXDomain);
    }

    response.add_query(query);
    response
}

#[cfg(test)]
mod tests {
    use hickory_proto::op::Query;

    use super::*;

    async fn ask(addr: SocketAddr, packet: &[u8]) -> Message {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket
            .send_to(packet, ("127.0.0.1", addr.port()))
            .await
            .unwrap();

        let mut buf = [0; 512];
        let (len, _) = socket.recv_from(&mut buf).await.unwrap();
        Message::from_vec(&buf[..len]).unwrap()
    }

    fn query(name: &str, record_type: RecordType) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(7);
        msg.add_query(Query::query(Name::from_ascii(name).unwrap(), record_type));
        msg.to_vec().unwrap()
    }

    #[test]
    fn txt_value_is_unpadded_standard_base64() {
        let value = dns_txt_value("tok.thumb");
        assert_eq!(value.len(), 43);
        assert!(!value.contains('='));
        assert_eq!(
            BASE64_STANDARD_NO_PAD.decode(&value).unwrap(),
            Sha256::digest(b"tok.thumb").as_slice()
        );
    }

    #[tokio::test]
    async fn answers_only_the_challenge_record() {
        let response = ChallengeResponse::new("dns-01", "tok", "tok.thumb".to_owned());
        let mut validator = Dns01Validator::new("example.com", &response, 0).unwrap();
        let addr = validator.start().await.unwrap();

        let reply = ask(addr, &query("_acme-challenge.example.com.", RecordType::TXT)).await;
        assert_eq!(reply.id(), 7);
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert_eq!(reply.answers().len(), 1);

        let answer = &reply.answers()[0];
        assert_eq!(answer.ttl(), TXT_TTL);
        match answer.data() {
            Some(RData::TXT(txt)) => {
                assert_eq!(&*txt.txt_data()[0], dns_txt_value("tok.thumb").as_bytes())
            }
            other => panic!("unexpected answer {other:?}"),
        }

        for (name, record_type) in [
            ("_acme-challenge.example.org.", RecordType::TXT),
            ("_acme-challenge.example.com.", RecordType::A),
            ("example.com.", RecordType::TXT),
        ] {
            let reply = ask(addr, &query(name, record_type)).await;
            assert_eq!(reply.response_code(), ResponseCode::NXDomain, "{name}");
            assert!(reply.answers().is_empty());
        }

        let reply = ask(addr, b"\x00\x01garbage").await;
        assert_eq!(reply.response_code(), ResponseCode::FormErr);

        validator.stop().await;
    }
}
