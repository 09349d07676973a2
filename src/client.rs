//! Client proxy library.
//!
//! [`create_proxy`] connects, opens a session, and fetches the enum
//! definition table once. Remote objects materialize as [`ObjectProxy`]
//! values carrying their server identity and kind. Dropping a proxy never
//! releases anything on the server; release is explicit (`close`) or happens
//! when the session is torn down.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tonic::transport::Channel;

use crate::codec::{self, CodecError};
use crate::introspect::EnumDef;
use crate::proto;
use crate::proto::tagger_rpc_client::TaggerRpcClient;
use crate::value::{ObjectRef, Value};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The server returned a value of a shape the caller did not expect.
    #[error("unexpected result: {0}")]
    Unexpected(String),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Shared per-session state. The tonic client is cheap to clone; every call
/// clones it so proxies can stay `&self`.
#[derive(Clone)]
struct Connection {
    rpc: TaggerRpcClient<Channel>,
    session_id: String,
    enums: Arc<BTreeMap<String, EnumDef>>,
}

impl Connection {
    async fn call(&self, object_id: &str, member: &str, args: &[Value]) -> ClientResult<Value> {
        let reply = self
            .rpc
            .clone()
            .call_member(proto::CallMemberRequest {
                session_id: self.session_id.clone(),
                object_id: object_id.to_string(),
                member: member.to_string(),
                args_json: codec::encode_args(args),
            })
            .await?
            .into_inner();
        Ok(codec::decode_result(&reply.result_json)?)
    }
}

/// Connects to a server and opens a session.
pub async fn create_proxy(host: &str, port: u16) -> ClientResult<RootProxy> {
    let endpoint = format!("http://{}:{}", host, port);
    let mut rpc = TaggerRpcClient::connect(endpoint).await?;

    let opened = rpc
        .open_session(proto::OpenSessionRequest {})
        .await?
        .into_inner();

    let enums = rpc
        .enum_definitions(proto::EnumDefinitionsRequest {})
        .await?
        .into_inner()
        .enums
        .into_iter()
        .map(|def| {
            let variants = def
                .variants
                .into_iter()
                .map(|v| (v.label, v.value))
                .collect();
            (
                def.name,
                EnumDef {
                    representation: def.representation,
                    variants,
                },
            )
        })
        .collect();

    Ok(RootProxy {
        conn: Connection {
            rpc,
            session_id: opened.session_id,
            enums: Arc::new(enums),
        },
        root_id: opened.root_id,
    })
}

/// Proxy for the root library object.
pub struct RootProxy {
    conn: Connection,
    root_id: String,
}

impl RootProxy {
    pub fn session_id(&self) -> &str {
        &self.conn.session_id
    }

    /// Enum definitions reconstructed from the server, fetched once at
    /// connect time.
    pub fn enums(&self) -> &BTreeMap<String, EnumDef> {
        &self.conn.enums
    }

    /// Looks up the integer value of an enum variant by name.
    pub fn enum_value(&self, enum_name: &str, label: &str) -> Option<i64> {
        self.conn.enums.get(enum_name).and_then(|def| {
            def.variants
                .iter()
                .find(|(l, _)| l == label)
                .map(|(_, v)| *v)
        })
    }

    /// The constructors and free functions the server exposes.
    pub async fn describe(&self) -> ClientResult<proto::DescribeReply> {
        Ok(self
            .conn
            .rpc
            .clone()
            .describe(proto::DescribeRequest {})
            .await?
            .into_inner())
    }

    /// Invokes a root member: a free function, `freeTimeTagger`, or a
    /// constructor (use [`RootProxy::create`] to get the proxy directly).
    pub async fn call(&self, member: &str, args: &[Value]) -> ClientResult<Value> {
        self.conn.call(&self.root_id, member, args).await
    }

    /// Invokes a constructor member and wraps the returned reference.
    pub async fn create(&self, member: &str, args: &[Value]) -> ClientResult<ObjectProxy> {
        match self.call(member, args).await? {
            Value::Ref(reference) => Ok(self.proxy(reference)),
            other => Err(ClientError::Unexpected(format!(
                "'{}' did not return an object reference: {:?}",
                member, other
            ))),
        }
    }

    /// Wraps a reference received some other way (e.g. out of a result list).
    pub fn proxy(&self, reference: ObjectRef) -> ObjectProxy {
        ObjectProxy {
            conn: self.conn.clone(),
            reference,
        }
    }

    /// Tears down the session, releasing every object it still owns on the
    /// server. Returns the number of objects released.
    pub async fn close_session(self) -> ClientResult<u32> {
        let reply = self
            .conn
            .rpc
            .clone()
            .close_session(proto::CloseSessionRequest {
                session_id: self.conn.session_id.clone(),
            })
            .await?
            .into_inner();
        Ok(reply.released)
    }
}

/// Proxy for one server-tracked object.
#[derive(Clone)]
pub struct ObjectProxy {
    conn: Connection,
    reference: ObjectRef,
}

impl ObjectProxy {
    pub fn id(&self) -> &str {
        &self.reference.id
    }

    pub fn kind(&self) -> &str {
        &self.reference.kind
    }

    /// The wire reference, for passing this object as an argument.
    pub fn reference(&self) -> &ObjectRef {
        &self.reference
    }

    pub async fn call(&self, member: &str, args: &[Value]) -> ClientResult<Value> {
        self.conn.call(&self.reference.id, member, args).await
    }

    /// Invokes a member expected to return a reference (`getDataObject`,
    /// `getTagger`) and wraps it.
    pub async fn call_object(&self, member: &str, args: &[Value]) -> ClientResult<ObjectProxy> {
        match self.call(member, args).await? {
            Value::Ref(reference) => Ok(ObjectProxy {
                conn: self.conn.clone(),
                reference,
            }),
            other => Err(ClientError::Unexpected(format!(
                "'{}' did not return an object reference: {:?}",
                member, other
            ))),
        }
    }

    pub async fn get(&self, name: &str) -> ClientResult<Value> {
        let reply = self
            .conn
            .rpc
            .clone()
            .get_property(proto::PropertyRequest {
                session_id: self.conn.session_id.clone(),
                object_id: self.reference.id.clone(),
                name: name.to_string(),
            })
            .await?
            .into_inner();
        Ok(codec::decode_result(&reply.result_json)?)
    }

    pub async fn set(&self, name: &str, value: &Value) -> ClientResult<()> {
        self.conn
            .rpc
            .clone()
            .set_property(proto::SetPropertyRequest {
                session_id: self.conn.session_id.clone(),
                object_id: self.reference.id.clone(),
                name: name.to_string(),
                value_json: codec::encode_result(value),
            })
            .await?;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> ClientResult<()> {
        self.conn
            .rpc
            .clone()
            .delete_property(proto::PropertyRequest {
                session_id: self.conn.session_id.clone(),
                object_id: self.reference.id.clone(),
                name: name.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Explicitly releases the server-side object. Idempotent; returns
    /// `false` when the object was already closed.
    pub async fn close(&self) -> ClientResult<bool> {
        let reply = self
            .conn
            .rpc
            .clone()
            .release_object(proto::ReleaseObjectRequest {
                session_id: self.conn.session_id.clone(),
                object_id: self.reference.id.clone(),
            })
            .await?
            .into_inner();
        Ok(reply.was_open)
    }
}
