//! Serialize and deserialize Krpc style messages for the four rpcs.

mod internal;

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::Bytes;

use crate::common::{DhtTime, Id, Node, StoredValue, ID_SIZE};
use crate::{Error, Result};

const NODE_BYTE_SIZE: usize = ID_SIZE + 6;

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    pub transaction_id: u32,

    /// The version of the requester or responder.
    pub version: Option<Vec<u8>>,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub struct RequestSpecific {
    pub requester_id: Id,
    pub request_type: RequestTypeSpecific,
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestTypeSpecific {
    Ping,
    Store(StoreRequestArguments),
    FindNode(FindNodeRequestArguments),
    FindValue(FindValueRequestArguments),
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseSpecific {
    Ping(PingResponseArguments),
    Store(StoreResponseArguments),
    FindNode(FindNodeResponseArguments),
    FindValue(FindValueResponseArguments),
}

// === PING ===

#[derive(Debug, PartialEq, Clone)]
pub struct PingResponseArguments {
    pub responder_id: Id,
}

// === STORE ===

#[derive(Debug, PartialEq, Clone)]
pub struct StoreRequestArguments {
    pub key: Id,
    pub value: Bytes,
    pub expiration_time: DhtTime,
}

#[derive(Debug, PartialEq, Clone)]
pub struct StoreResponseArguments {
    pub responder_id: Id,
    pub accepted: bool,
}

// === FIND_NODE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeResponseArguments {
    pub responder_id: Id,
    pub nodes: Vec<Node>,
}

// === FIND_VALUE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindValueRequestArguments {
    pub key: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindValueResponseArguments {
    pub responder_id: Id,
    pub value: Option<StoredValue>,
    pub nodes: Vec<Node>,
}

impl Message {
    fn into_serde_message(self) -> internal::DHTMessage {
        internal::DHTMessage {
            transaction_id: self.transaction_id.to_be_bytes().to_vec(),
            version: self.version,
            variant: match self.message_type {
                MessageType::Request(RequestSpecific {
                    requester_id,
                    request_type,
                }) => internal::DHTMessageVariant::Request(match request_type {
                    RequestTypeSpecific::Ping => internal::DHTRequestSpecific::Ping {
                        arguments: internal::DHTPingRequestArguments {
                            id: requester_id.to_vec(),
                        },
                    },
                    RequestTypeSpecific::Store(store_args) => internal::DHTRequestSpecific::Store {
                        arguments: internal::DHTStoreRequestArguments {
                            id: requester_id.to_vec(),
                            key: store_args.key.to_vec(),
                            v: store_args.value.to_vec(),
                            exp: time_to_bytes(store_args.expiration_time),
                        },
                    },
                    RequestTypeSpecific::FindNode(find_node_args) => {
                        internal::DHTRequestSpecific::FindNode {
                            arguments: internal::DHTFindNodeRequestArguments {
                                id: requester_id.to_vec(),
                                target: find_node_args.target.to_vec(),
                            },
                        }
                    }
                    RequestTypeSpecific::FindValue(find_value_args) => {
                        internal::DHTRequestSpecific::FindValue {
                            arguments: internal::DHTFindValueRequestArguments {
                                id: requester_id.to_vec(),
                                key: find_value_args.key.to_vec(),
                            },
                        }
                    }
                }),

                MessageType::Response(res) => internal::DHTMessageVariant::Response(match res {
                    ResponseSpecific::Ping(ping_args) => internal::DHTResponseSpecific::Ping {
                        arguments: internal::DHTPingResponseArguments {
                            id: ping_args.responder_id.to_vec(),
                        },
                    },
                    ResponseSpecific::Store(store_args) => internal::DHTResponseSpecific::Store {
                        arguments: internal::DHTStoreResponseArguments {
                            id: store_args.responder_id.to_vec(),
                            accepted: store_args.accepted.into(),
                        },
                    },
                    ResponseSpecific::FindNode(find_node_args) => {
                        internal::DHTResponseSpecific::FindNode {
                            arguments: internal::DHTFindNodeResponseArguments {
                                id: find_node_args.responder_id.to_vec(),
                                nodes: nodes4_to_bytes(&find_node_args.nodes),
                            },
                        }
                    }
                    ResponseSpecific::FindValue(find_value_args) => {
                        let (v, exp) = match find_value_args.value {
                            Some(stored) => (
                                Some(stored.value.to_vec()),
                                Some(time_to_bytes(stored.expiration_time)),
                            ),
                            None => (None, None),
                        };

                        internal::DHTResponseSpecific::FindValue {
                            arguments: internal::DHTFindValueResponseArguments {
                                id: find_value_args.responder_id.to_vec(),
                                nodes: nodes4_to_bytes(&find_value_args.nodes),
                                v,
                                exp,
                            },
                        }
                    }
                }),
            },
        }
    }

    fn from_serde_message(msg: internal::DHTMessage) -> Result<Message> {
        Ok(Message {
            transaction_id: transaction_id(msg.transaction_id)?,
            version: msg.version,
            message_type: match msg.variant {
                internal::DHTMessageVariant::Request(req_variant) => {
                    MessageType::Request(match req_variant {
                        internal::DHTRequestSpecific::Ping { arguments } => RequestSpecific {
                            requester_id: Id::from_bytes(arguments.id)?,
                            request_type: RequestTypeSpecific::Ping,
                        },
                        internal::DHTRequestSpecific::Store { arguments } => RequestSpecific {
                            requester_id: Id::from_bytes(arguments.id)?,
                            request_type: RequestTypeSpecific::Store(StoreRequestArguments {
                                key: Id::from_bytes(arguments.key)?,
                                value: arguments.v.into(),
                                expiration_time: bytes_to_time(&arguments.exp)?,
                            }),
                        },
                        internal::DHTRequestSpecific::FindNode { arguments } => RequestSpecific {
                            requester_id: Id::from_bytes(arguments.id)?,
                            request_type: RequestTypeSpecific::FindNode(FindNodeRequestArguments {
                                target: Id::from_bytes(arguments.target)?,
                            }),
                        },
                        internal::DHTRequestSpecific::FindValue { arguments } => RequestSpecific {
                            requester_id: Id::from_bytes(arguments.id)?,
                            request_type: RequestTypeSpecific::FindValue(
                                FindValueRequestArguments {
                                    key: Id::from_bytes(arguments.key)?,
                                },
                            ),
                        },
                    })
                }

                internal::DHTMessageVariant::Response(res_variant) => {
                    MessageType::Response(match res_variant {
                        internal::DHTResponseSpecific::Ping { arguments } => {
                            ResponseSpecific::Ping(PingResponseArguments {
                                responder_id: Id::from_bytes(arguments.id)?,
                            })
                        }
                        internal::DHTResponseSpecific::Store { arguments } => {
                            ResponseSpecific::Store(StoreResponseArguments {
                                responder_id: Id::from_bytes(arguments.id)?,
                                accepted: arguments.accepted != 0,
                            })
                        }
                        internal::DHTResponseSpecific::FindNode { arguments } => {
                            ResponseSpecific::FindNode(FindNodeResponseArguments {
                                responder_id: Id::from_bytes(&arguments.id)?,
                                nodes: bytes_to_nodes4(&arguments.nodes)?,
                            })
                        }
                        internal::DHTResponseSpecific::FindValue { arguments } => {
                            let value = match (arguments.v, arguments.exp) {
                                (Some(v), Some(exp)) => {
                                    Some(StoredValue::new(v.into(), bytes_to_time(&exp)?))
                                }
                                (None, None) => None,
                                _ => {
                                    return Err(Error::Static(
                                        "find_value response with a value but no expiration",
                                    ))
                                }
                            };

                            ResponseSpecific::FindValue(FindValueResponseArguments {
                                responder_id: Id::from_bytes(&arguments.id)?,
                                value,
                                nodes: bytes_to_nodes4(&arguments.nodes)?,
                            })
                        }
                    })
                }
            },
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.clone().into_serde_message().to_bytes()?)
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message> {
        Message::from_serde_message(internal::DHTMessage::from_bytes(bytes)?)
    }

    /// Return the Id of the sender of the Message
    pub fn get_author_id(&self) -> Id {
        match &self.message_type {
            MessageType::Request(arguments) => arguments.requester_id,
            MessageType::Response(response_variant) => match response_variant {
                ResponseSpecific::Ping(arguments) => arguments.responder_id,
                ResponseSpecific::Store(arguments) => arguments.responder_id,
                ResponseSpecific::FindNode(arguments) => arguments.responder_id,
                ResponseSpecific::FindValue(arguments) => arguments.responder_id,
            },
        }
    }
}

/// Return the transaction Id as a u32
pub fn transaction_id(bytes: Vec<u8>) -> Result<u32> {
    match <[u8; 4]>::try_from(bytes.as_slice()) {
        Ok(array) => Ok(u32::from_be_bytes(array)),
        Err(_) => Err(Error::InvalidTransactionId(bytes)),
    }
}

fn time_to_bytes(time: DhtTime) -> Vec<u8> {
    time.to_bits().to_be_bytes().to_vec()
}

fn bytes_to_time(bytes: &[u8]) -> Result<DhtTime> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Static("expiration time should be 8 bytes"))?;

    Ok(f64::from_bits(u64::from_be_bytes(array)))
}

fn bytes_to_sockaddr<T: AsRef<[u8]>>(bytes: T) -> Result<SocketAddrV4> {
    let bytes = bytes.as_ref();

    if bytes.len() != 6 {
        return Err(Error::Static("Wrong number of bytes for sockaddr"));
    }

    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);

    Ok(SocketAddrV4::new(ip, port))
}

pub fn sockaddr_to_bytes(sockaddr: &SocketAddrV4) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(6);

    bytes.extend(sockaddr.ip().octets());
    bytes.extend(sockaddr.port().to_be_bytes());

    bytes
}

fn nodes4_to_bytes(nodes: &[Node]) -> Vec<u8> {
    let mut vec = Vec::with_capacity(NODE_BYTE_SIZE * nodes.len());
    for node in nodes {
        vec.extend(node.id.as_bytes());
        vec.extend(sockaddr_to_bytes(&node.address));
    }
    vec
}

fn bytes_to_nodes4<T: AsRef<[u8]>>(bytes: T) -> Result<Vec<Node>> {
    let bytes = bytes.as_ref();
    if bytes.len() % NODE_BYTE_SIZE != 0 {
        return Err(Error::Static("Wrong number of bytes for nodes message"));
    }

    bytes
        .chunks_exact(NODE_BYTE_SIZE)
        .map(|chunk| {
            Ok(Node::new(
                Id::from_bytes(&chunk[..ID_SIZE])?,
                bytes_to_sockaddr(&chunk[ID_SIZE..])?,
            ))
        })
        .collect()
}
