//! gRPC surface of the adapter layer.
//!
//! The service is a thin shell: it validates the session, decodes JSON
//! payloads through the codec, hands dispatch to [`LibraryAdapter`], and
//! encodes the result. All domain errors map to gRPC status codes through
//! the `RpcError` conversion.

use std::net::SocketAddr;
use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::adapter::{LibraryAdapter, ROOT_OBJECT_ID};
use crate::codec;
use crate::config::Settings;
use crate::error::{RpcError, RpcResult};
use crate::introspect::classify;
use crate::native::NativeLibrary;
use crate::proto;
use crate::proto::tagger_rpc_server::{TaggerRpc, TaggerRpcServer};
use crate::registry::Registry;
use crate::value::Value;

pub struct TaggerRpcService {
    registry: Arc<Registry>,
    library: Arc<LibraryAdapter>,
}

impl TaggerRpcService {
    pub fn new(registry: Arc<Registry>, library: Arc<LibraryAdapter>) -> Self {
        Self { registry, library }
    }

    /// Builds the full service stack over a native library.
    pub fn bootstrap(native: Arc<dyn NativeLibrary>) -> RpcResult<(Arc<Registry>, Self)> {
        let surface = classify(&native.descriptor())?;
        let registry = Registry::new(Arc::clone(&native));
        let library = Arc::new(LibraryAdapter::new(native, Arc::clone(&registry), surface)?);
        let service = Self::new(Arc::clone(&registry), library);
        Ok((registry, service))
    }

    fn dispatch_member(
        &self,
        session: &str,
        object_id: &str,
        member: &str,
        args: &[Value],
    ) -> RpcResult<Value> {
        self.registry.touch(session)?;
        if object_id == ROOT_OBJECT_ID {
            self.library.call_root(session, member, args)
        } else {
            let adapter = self.registry.resolve(object_id)?;
            self.library.call_member(session, &adapter, member, args)
        }
    }

    fn dispatch_property(
        &self,
        session: &str,
        object_id: &str,
        name: &str,
        op: PropertyOp,
    ) -> RpcResult<Value> {
        self.registry.touch(session)?;
        if object_id == ROOT_OBJECT_ID {
            // The root object has constructors and functions, no properties.
            return Err(RpcError::UnknownMember {
                target: ROOT_OBJECT_ID.to_string(),
                member: name.to_string(),
            });
        }
        let adapter = self.registry.resolve(object_id)?;
        match op {
            PropertyOp::Get => self.library.get_property(&adapter, name),
            PropertyOp::Set(value) => self.library.set_property(&adapter, name, value),
            PropertyOp::Delete => self.library.delete_property(&adapter, name),
        }
    }
}

enum PropertyOp {
    Get,
    Set(Value),
    Delete,
}

#[tonic::async_trait]
impl TaggerRpc for TaggerRpcService {
    async fn open_session(
        &self,
        _request: Request<proto::OpenSessionRequest>,
    ) -> Result<Response<proto::OpenSessionReply>, Status> {
        let session_id = self.registry.open_session();
        Ok(Response::new(proto::OpenSessionReply {
            session_id,
            root_id: ROOT_OBJECT_ID.to_string(),
        }))
    }

    async fn close_session(
        &self,
        request: Request<proto::CloseSessionRequest>,
    ) -> Result<Response<proto::CloseSessionReply>, Status> {
        let req = request.into_inner();
        let released = self.registry.close_session(&req.session_id) as u32;
        Ok(Response::new(proto::CloseSessionReply { released }))
    }

    async fn describe(
        &self,
        _request: Request<proto::DescribeRequest>,
    ) -> Result<Response<proto::DescribeReply>, Status> {
        let constructors = self
            .library
            .constructors()
            .into_iter()
            .map(|(name, kind)| proto::ConstructorInfo {
                name,
                kind: kind.as_str().to_string(),
            })
            .collect();
        let functions = self.library.functions().map(str::to_string).collect();
        Ok(Response::new(proto::DescribeReply {
            constructors,
            functions,
        }))
    }

    async fn enum_definitions(
        &self,
        _request: Request<proto::EnumDefinitionsRequest>,
    ) -> Result<Response<proto::EnumDefinitionsReply>, Status> {
        let enums = self
            .library
            .enums()
            .iter()
            .map(|(name, def)| proto::EnumDefinition {
                name: name.clone(),
                representation: def.representation.clone(),
                variants: def
                    .variants
                    .iter()
                    .map(|(label, value)| proto::EnumVariant {
                        label: label.clone(),
                        value: *value,
                    })
                    .collect(),
            })
            .collect();
        Ok(Response::new(proto::EnumDefinitionsReply { enums }))
    }

    async fn call_member(
        &self,
        request: Request<proto::CallMemberRequest>,
    ) -> Result<Response<proto::CallMemberReply>, Status> {
        let req = request.into_inner();
        let args = codec::decode_args(&req.args_json).map_err(RpcError::from)?;
        let result = self.dispatch_member(&req.session_id, &req.object_id, &req.member, &args)?;
        Ok(Response::new(proto::CallMemberReply {
            result_json: codec::encode_result(&result),
        }))
    }

    async fn get_property(
        &self,
        request: Request<proto::PropertyRequest>,
    ) -> Result<Response<proto::CallMemberReply>, Status> {
        let req = request.into_inner();
        let result =
            self.dispatch_property(&req.session_id, &req.object_id, &req.name, PropertyOp::Get)?;
        Ok(Response::new(proto::CallMemberReply {
            result_json: codec::encode_result(&result),
        }))
    }

    async fn set_property(
        &self,
        request: Request<proto::SetPropertyRequest>,
    ) -> Result<Response<proto::CallMemberReply>, Status> {
        let req = request.into_inner();
        let value = codec::decode_result(&req.value_json).map_err(RpcError::from)?;
        let result = self.dispatch_property(
            &req.session_id,
            &req.object_id,
            &req.name,
            PropertyOp::Set(value),
        )?;
        Ok(Response::new(proto::CallMemberReply {
            result_json: codec::encode_result(&result),
        }))
    }

    async fn delete_property(
        &self,
        request: Request<proto::PropertyRequest>,
    ) -> Result<Response<proto::CallMemberReply>, Status> {
        let req = request.into_inner();
        let result = self.dispatch_property(
            &req.session_id,
            &req.object_id,
            &req.name,
            PropertyOp::Delete,
        )?;
        Ok(Response::new(proto::CallMemberReply {
            result_json: codec::encode_result(&result),
        }))
    }

    async fn release_object(
        &self,
        request: Request<proto::ReleaseObjectRequest>,
    ) -> Result<Response<proto::ReleaseObjectReply>, Status> {
        let req = request.into_inner();
        self.registry.touch(&req.session_id).map_err(Status::from)?;
        // Release is idempotent at the identity level: an id that no longer
        // resolves was already closed.
        let was_open = match self.registry.resolve(&req.object_id) {
            Ok(adapter) => self.registry.close(&adapter)?,
            Err(RpcError::StaleReference(_)) => false,
            Err(err) => return Err(err.into()),
        };
        Ok(Response::new(proto::ReleaseObjectReply { was_open }))
    }
}

/// Runs the gRPC server until shutdown, with the idle-session sweeper
/// running alongside it.
pub async fn serve(settings: Settings, native: Arc<dyn NativeLibrary>) -> anyhow::Result<()> {
    let (registry, service) = TaggerRpcService::bootstrap(native)?;
    let addr: SocketAddr = settings.listen_addr().parse()?;

    let timeout = settings.session_timeout();
    let sweep_interval = settings.sweep_interval();
    let sweeper_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            for session in sweeper_registry.expired_sessions(timeout) {
                tracing::info!(session = %session, "expiring idle session");
                sweeper_registry.close_session(&session);
            }
        }
    });

    tracing::info!(%addr, "tagger-rpc server listening");
    tonic::transport::Server::builder()
        .add_service(TaggerRpcServer::new(service))
        .serve(addr)
        .await?;
    Ok(())
}
