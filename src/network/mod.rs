pub mod replication;
pub mod schema;
pub mod transport;

use crate::math::ZERO_VEC3F;
use crate::world::{ChangedFlags, ClientId, Pose, TransformUpdate, Uid, WorldObject};
use crate::wire::{InStream, MAX_STRING_LEN, OutStream, ProtocolError};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const CYBERSPACE_HELLO: u32 = 1_357_924_680;
pub const PROTOCOL_VERSION: u32 = 14;
pub const OLDEST_SUPPORTED_PROTOCOL_VERSION: u32 = 13;
/// Largest payload accepted for a single message.
pub const MAX_MESSAGE_LEN: usize = 4 * 1024 * 1024;
const MESSAGE_HEADER_LEN: usize = 8;

pub mod message_type {
    pub const AVATAR_CREATED: u32 = 1000;
    pub const AVATAR_DESTROYED: u32 = 1001;
    pub const AVATAR_TRANSFORM_UPDATE: u32 = 1002;
    pub const OBJECT_CREATED: u32 = 3000;
    pub const OBJECT_DESTROYED: u32 = 3001;
    pub const OBJECT_TRANSFORM_UPDATE: u32 = 3002;
    pub const OBJECT_FULL_UPDATE: u32 = 3003;
    pub const OBJECT_PHYSICS_OWNERSHIP_TAKEN: u32 = 3010;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolStatus {
    Ok,
    ClientTooOld,
    ClientTooNew,
}

impl ProtocolStatus {
    pub fn code(self) -> u32 {
        match self {
            ProtocolStatus::Ok => 10000,
            ProtocolStatus::ClientTooOld => 10001,
            ProtocolStatus::ClientTooNew => 10002,
        }
    }
}

pub fn negotiate(client_version: u32) -> ProtocolStatus {
    if client_version < OLDEST_SUPPORTED_PROTOCOL_VERSION {
        ProtocolStatus::ClientTooOld
    } else if client_version > PROTOCOL_VERSION {
        ProtocolStatus::ClientTooNew
    } else {
        ProtocolStatus::Ok
    }
}

pub fn write_hello(out: &mut OutStream) {
    out.write_u32(CYBERSPACE_HELLO);
    out.write_u32(PROTOCOL_VERSION);
}

/// Reads a client hello and decides whether its protocol version is served.
pub fn read_hello(input: &mut InStream<'_>) -> Result<ProtocolStatus, ProtocolError> {
    let hello = input.read_u32()?;
    if hello != CYBERSPACE_HELLO {
        return Err(ProtocolError::BadHello(hello));
    }
    let version = input.read_u32()?;
    let status = negotiate(version);
    if status != ProtocolStatus::Ok {
        log::warn!("[network] client protocol {version} rejected: {status:?}");
    }
    Ok(status)
}

/// A world object in network form, uid split out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPayload {
    pub uid: Uid,
    pub body: Vec<u8>,
}

impl ObjectPayload {
    pub fn from_object(ob: &WorldObject) -> Self {
        let mut out = OutStream::new();
        ob.write_network_body(&mut out);
        Self {
            uid: ob.uid,
            body: out.into_bytes(),
        }
    }

    pub fn to_object(&self) -> Result<WorldObject, ProtocolError> {
        WorldObject::from_network_given_uid(self.uid, &mut InStream::new(&self.body))
    }

    pub fn apply_to(&self, ob: &mut WorldObject) -> Result<ChangedFlags, ProtocolError> {
        ob.read_network_given_uid(&mut InStream::new(&self.body))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    AvatarCreated {
        uid: Uid,
        name: String,
        model_url: String,
        pose: Pose,
    },
    AvatarDestroyed {
        uid: Uid,
    },
    AvatarTransformUpdate {
        uid: Uid,
        pose: Pose,
    },
    ObjectCreated(ObjectPayload),
    ObjectDestroyed {
        uid: Uid,
    },
    ObjectTransformUpdate {
        uid: Uid,
        author: ClientId,
        update: TransformUpdate,
    },
    ObjectFullUpdate(ObjectPayload),
    ObjectPhysicsOwnershipTaken {
        uid: Uid,
        owner: ClientId,
        change_time: f64,
    },
}

fn write_pose(out: &mut OutStream, pose: &Pose) {
    out.write_vec3d(pose.pos);
    out.write_vec3f(pose.axis);
    out.write_f32(pose.angle);
}

fn read_pose(input: &mut InStream<'_>) -> Result<Pose, ProtocolError> {
    Ok(Pose::new(input.read_vec3d()?, input.read_vec3f()?, input.read_f32()?))
}

impl WireMessage {
    pub fn type_id(&self) -> u32 {
        use message_type::*;
        match self {
            WireMessage::AvatarCreated { .. } => AVATAR_CREATED,
            WireMessage::AvatarDestroyed { .. } => AVATAR_DESTROYED,
            WireMessage::AvatarTransformUpdate { .. } => AVATAR_TRANSFORM_UPDATE,
            WireMessage::ObjectCreated(_) => OBJECT_CREATED,
            WireMessage::ObjectDestroyed { .. } => OBJECT_DESTROYED,
            WireMessage::ObjectTransformUpdate { .. } => OBJECT_TRANSFORM_UPDATE,
            WireMessage::ObjectFullUpdate(_) => OBJECT_FULL_UPDATE,
            WireMessage::ObjectPhysicsOwnershipTaken { .. } => OBJECT_PHYSICS_OWNERSHIP_TAKEN,
        }
    }

    pub fn uid(&self) -> Uid {
        match self {
            WireMessage::AvatarCreated { uid, .. }
            | WireMessage::AvatarDestroyed { uid }
            | WireMessage::AvatarTransformUpdate { uid, .. }
            | WireMessage::ObjectDestroyed { uid }
            | WireMessage::ObjectTransformUpdate { uid, .. }
            | WireMessage::ObjectPhysicsOwnershipTaken { uid, .. } => *uid,
            WireMessage::ObjectCreated(payload) | WireMessage::ObjectFullUpdate(payload) => {
                payload.uid
            }
        }
    }

    pub fn object_created(ob: &WorldObject) -> Self {
        WireMessage::ObjectCreated(ObjectPayload::from_object(ob))
    }

    pub fn object_full_update(ob: &WorldObject) -> Self {
        WireMessage::ObjectFullUpdate(ObjectPayload::from_object(ob))
    }

    /// Writes the type id, payload length and payload.
    pub fn encode(&self, out: &mut OutStream) {
        out.write_u32(self.type_id());
        let len_at = out.len();
        out.write_u32(0);
        let start = out.len();
        match self {
            WireMessage::AvatarCreated {
                uid,
                name,
                model_url,
                pose,
            } => {
                out.write_u64(uid.0);
                out.write_string(name);
                out.write_string(model_url);
                write_pose(out, pose);
            }
            WireMessage::AvatarDestroyed { uid } | WireMessage::ObjectDestroyed { uid } => {
                out.write_u64(uid.0);
            }
            WireMessage::AvatarTransformUpdate { uid, pose } => {
                out.write_u64(uid.0);
                write_pose(out, pose);
            }
            WireMessage::ObjectCreated(payload) | WireMessage::ObjectFullUpdate(payload) => {
                out.write_u64(payload.uid.0);
                out.write_data(&payload.body);
            }
            WireMessage::ObjectTransformUpdate {
                uid,
                author,
                update,
            } => {
                out.write_u64(uid.0);
                out.write_u64(author.0);
                out.write_vec3d(update.pos);
                out.write_vec3f(update.axis);
                out.write_f32(update.angle);
                out.write_f64(update.send_time);
                out.write_vec3f(update.linear_velocity);
                out.write_vec3f(update.angular_velocity);
            }
            WireMessage::ObjectPhysicsOwnershipTaken {
                uid,
                owner,
                change_time,
            } => {
                out.write_u64(uid.0);
                out.write_u64(owner.0);
                out.write_f64(*change_time);
            }
        }
        let payload_len = out.len() - start;
        out.patch_u32(len_at, payload_len as u32);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = OutStream::new();
        self.encode(&mut out);
        out.into_bytes()
    }

    /// Decodes one framed message. Unknown type ids are consumed (the payload
    /// length is known) and reported as an error.
    pub fn decode(input: &mut InStream<'_>) -> Result<WireMessage, ProtocolError> {
        use message_type::*;
        let type_id = input.read_u32()?;
        let len = input.read_u32()? as usize;
        if len > MAX_MESSAGE_LEN {
            return Err(ProtocolError::OversizedField {
                field: "message",
                len,
                max: MAX_MESSAGE_LEN,
            });
        }
        let mut payload = InStream::new(input.read_data(len)?);
        let p = &mut payload;

        let message = match type_id {
            AVATAR_CREATED => WireMessage::AvatarCreated {
                uid: Uid(p.read_u64()?),
                name: p.read_string("avatar_name", MAX_STRING_LEN)?,
                model_url: p.read_string("avatar_model_url", MAX_STRING_LEN)?,
                pose: read_pose(p)?,
            },
            AVATAR_DESTROYED => WireMessage::AvatarDestroyed {
                uid: Uid(p.read_u64()?),
            },
            AVATAR_TRANSFORM_UPDATE => WireMessage::AvatarTransformUpdate {
                uid: Uid(p.read_u64()?),
                pose: read_pose(p)?,
            },
            OBJECT_CREATED | OBJECT_FULL_UPDATE => {
                let object = ObjectPayload {
                    uid: Uid(p.read_u64()?),
                    body: p.read_rest().to_vec(),
                };
                if type_id == OBJECT_CREATED {
                    WireMessage::ObjectCreated(object)
                } else {
                    WireMessage::ObjectFullUpdate(object)
                }
            }
            OBJECT_DESTROYED => WireMessage::ObjectDestroyed {
                uid: Uid(p.read_u64()?),
            },
            OBJECT_TRANSFORM_UPDATE => {
                let uid = Uid(p.read_u64()?);
                let author = ClientId(p.read_u64()?);
                let pos = p.read_vec3d()?;
                let axis = p.read_vec3f()?;
                let angle = p.read_f32()?;
                let send_time = p.read_f64()?;
                let (linear_velocity, angular_velocity) = if p.remaining() >= 24 {
                    (p.read_vec3f()?, p.read_vec3f()?)
                } else {
                    (ZERO_VEC3F, ZERO_VEC3F)
                };
                WireMessage::ObjectTransformUpdate {
                    uid,
                    author,
                    update: TransformUpdate {
                        pos,
                        axis,
                        angle,
                        linear_velocity,
                        angular_velocity,
                        send_time,
                    },
                }
            }
            OBJECT_PHYSICS_OWNERSHIP_TAKEN => WireMessage::ObjectPhysicsOwnershipTaken {
                uid: Uid(p.read_u64()?),
                owner: ClientId(p.read_u64()?),
                change_time: p.read_f64()?,
            },
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };
        Ok(message)
    }

    pub fn encoded_len(&self) -> usize {
        MESSAGE_HEADER_LEN
            + match self {
                WireMessage::ObjectCreated(payload) | WireMessage::ObjectFullUpdate(payload) => {
                    8 + payload.body.len()
                }
                other => other.to_bytes().len() - MESSAGE_HEADER_LEN,
            }
    }
}

pub fn encode_all(messages: &[WireMessage]) -> Vec<u8> {
    let mut out = OutStream::new();
    for message in messages {
        message.encode(&mut out);
    }
    out.into_bytes()
}

/// Decodes a buffer of concatenated messages.
pub fn decode_all(bytes: &[u8]) -> Result<Vec<WireMessage>, ProtocolError> {
    let mut input = InStream::new(bytes);
    let mut messages = Vec::new();
    while !input.end_of_stream() {
        messages.push(WireMessage::decode(&mut input)?);
    }
    Ok(messages)
}

/// A sequenced group of encoded messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBatch {
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub bytes: Vec<u8>,
}

/// Per-connection outbound sequencing.
pub struct NetworkSession {
    sequence: u64,
    protocol_version: u32,
}

impl NetworkSession {
    pub fn new() -> Self {
        Self {
            sequence: 0,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Accepts a client hello; `None` when the version is not served.
    pub fn accept(input: &mut InStream<'_>) -> Result<Option<Self>, ProtocolError> {
        let hello = input.read_u32()?;
        if hello != CYBERSPACE_HELLO {
            return Err(ProtocolError::BadHello(hello));
        }
        let version = input.read_u32()?;
        match negotiate(version) {
            ProtocolStatus::Ok => Ok(Some(Self {
                sequence: 0,
                protocol_version: version,
            })),
            status => {
                log::warn!("[network] refusing client protocol {version}: {status:?}");
                Ok(None)
            }
        }
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn next_sequence(&mut self) -> u64 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    pub fn craft_batch(&mut self, messages: &[WireMessage]) -> MessageBatch {
        MessageBatch {
            sequence: self.next_sequence(),
            timestamp_ms: current_time_millis(),
            bytes: encode_all(messages),
        }
    }
}

impl Default for NetworkSession {
    fn default() -> Self {
        Self::new()
    }
}

fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::DEFAULT_AXIS;
    use crate::world::ObjectType;
    use cgmath::Vector3;

    #[test]
    fn negotiation_bounds() {
        assert_eq!(negotiate(12), ProtocolStatus::ClientTooOld);
        assert_eq!(negotiate(13), ProtocolStatus::Ok);
        assert_eq!(negotiate(14), ProtocolStatus::Ok);
        assert_eq!(negotiate(15), ProtocolStatus::ClientTooNew);
        assert_eq!(ProtocolStatus::ClientTooNew.code(), 10002);
    }

    #[test]
    fn hello_is_checked() {
        let mut out = OutStream::new();
        write_hello(&mut out);
        let bytes = out.into_bytes();
        assert_eq!(read_hello(&mut InStream::new(&bytes)), Ok(ProtocolStatus::Ok));

        let bad = [1u8, 0, 0, 0, 14, 0, 0, 0];
        assert_eq!(
            read_hello(&mut InStream::new(&bad)),
            Err(ProtocolError::BadHello(1))
        );
    }

    #[test]
    fn mixed_messages_decode_in_order() {
        let mut ob = WorldObject::new(ObjectType::Text).with_model("models/sign.glb");
        ob.uid = Uid(3);
        ob.content = "welcome".into();
        let messages = vec![
            WireMessage::object_created(&ob),
            WireMessage::ObjectTransformUpdate {
                uid: Uid(3),
                author: ClientId(8),
                update: TransformUpdate::at_rest(Vector3::new(1.0, 2.0, 3.0), DEFAULT_AXIS, 0.5, 4.0),
            },
            WireMessage::AvatarCreated {
                uid: Uid(4),
                name: "ann".into(),
                model_url: "avatars/ann.glb".into(),
                pose: Pose::default(),
            },
            WireMessage::ObjectPhysicsOwnershipTaken {
                uid: Uid(3),
                owner: ClientId(8),
                change_time: 4.0,
            },
            WireMessage::ObjectDestroyed { uid: Uid(3) },
        ];
        let bytes = encode_all(&messages);
        let decoded = decode_all(&bytes).unwrap();
        assert_eq!(decoded, messages);

        let WireMessage::ObjectCreated(payload) = &decoded[0] else {
            panic!("expected object created");
        };
        let rebuilt = payload.to_object().unwrap();
        assert_eq!(rebuilt.content, "welcome");
        assert_eq!(rebuilt.uid, Uid(3));
    }

    #[test]
    fn unknown_type_is_reported() {
        let mut out = OutStream::new();
        out.write_u32(4242);
        out.write_u32(0);
        let bytes = out.into_bytes();
        assert_eq!(decode_all(&bytes), Err(ProtocolError::UnknownMessageType(4242)));
    }

    #[test]
    fn oversized_message_length_is_rejected() {
        let mut out = OutStream::new();
        out.write_u32(message_type::OBJECT_DESTROYED);
        out.write_u32(u32::MAX);
        let bytes = out.into_bytes();
        assert!(matches!(
            decode_all(&bytes),
            Err(ProtocolError::OversizedField { field: "message", .. })
        ));
    }

    #[test]
    fn encoded_len_matches_bytes() {
        let mut ob = WorldObject::default();
        ob.uid = Uid(1);
        let created = WireMessage::object_created(&ob);
        assert_eq!(created.encoded_len(), created.to_bytes().len());
        let destroyed = WireMessage::ObjectDestroyed { uid: Uid(1) };
        assert_eq!(destroyed.encoded_len(), destroyed.to_bytes().len());
    }

    #[test]
    fn session_sequences_batches() {
        let mut hello = OutStream::new();
        write_hello(&mut hello);
        let bytes = hello.into_bytes();
        let mut session = NetworkSession::accept(&mut InStream::new(&bytes))
            .unwrap()
            .expect("current protocol accepted");
        assert_eq!(session.protocol_version(), PROTOCOL_VERSION);
        let first = session.craft_batch(&[WireMessage::AvatarDestroyed { uid: Uid(2) }]);
        let second = session.craft_batch(&[]);
        assert_eq!(first.sequence + 1, second.sequence);
        assert!(second.bytes.is_empty());
    }
}
