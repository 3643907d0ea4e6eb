//! Master gRPC service implementation
//!
//! Thin wrapper translating between the wire types and the master core.
//! Single-key operations surface failures as gRPC status codes; batch
//! operations return a per-item `StatusCode` vector so one bad key does
//! not fail its siblings.

use mooncake_common::{ClientId, ClientStatus, Error, SegmentId};
use mooncake_proto::master::{
    master_service_server::MasterService as MasterRpc, BatchExistKeyRequest,
    BatchExistKeyResponse, BatchGetReplicaListRequest, BatchGetReplicaListResponse,
    BatchPutEndRequest, BatchPutEndResponse, BatchPutRevokeRequest, BatchPutRevokeResponse,
    BatchPutStartRequest, BatchPutStartResponse, BufferState, ClientState, ExistKeyRequest,
    ExistKeyResponse, ExistKeyResult, GetAllKeysRequest, GetAllKeysResponse,
    GetAllSegmentsRequest, GetAllSegmentsResponse, GetFsdirRequest, GetFsdirResponse,
    GetReplicaListRequest, GetReplicaListResponse, MountSegmentRequest, MountSegmentResponse,
    PingRequest, PingResponse, PutEndRequest, PutEndResponse, PutRevokeRequest,
    PutRevokeResponse, PutStartRequest, PutStartResponse, PutStartResult, QuerySegmentsRequest,
    QuerySegmentsResponse, ReMountSegmentRequest, ReMountSegmentResponse, RemoveAllRequest,
    RemoveAllResponse, RemoveRequest, RemoveResponse, ReplicaListResult, ReplicaState,
    StatusCode, UnmountSegmentRequest, UnmountSegmentResponse, UuidPair,
};
use mooncake_segment::{BufferStatus, Segment};
use mooncake_store::{MasterService, ReplicaDescriptor, ReplicaStatus, ReplicateConfig};
use std::sync::Arc;
use tonic::{Request, Response, Status};

/// gRPC front-end over one master instance
pub struct MasterRpcService {
    master: Arc<MasterService>,
}

impl MasterRpcService {
    pub fn new(master: Arc<MasterService>) -> Self {
        Self { master }
    }
}

fn to_status(e: Error) -> Status {
    let message = e.to_string();
    match e {
        Error::InvalidParams(_) => Status::invalid_argument(message),
        Error::ObjectNotFound(_) | Error::SegmentNotFound(_) => Status::not_found(message),
        Error::ObjectAlreadyExists(_) | Error::SegmentAlreadyExists(_) => {
            Status::already_exists(message)
        }
        Error::ObjectHasLease(_)
        | Error::ReplicaIsNotReady(_)
        | Error::InvalidWrite(_)
        | Error::InvalidReplica(_)
        | Error::UnavailableInCurrentMode(_) => Status::failed_precondition(message),
        Error::NoAvailableHandle { .. } => Status::resource_exhausted(message),
        Error::TransferFail(_) | Error::RpcFail(_) => Status::unavailable(message),
        Error::InternalError(_) => Status::internal(message),
    }
}

fn to_code(e: &Error) -> StatusCode {
    match e {
        Error::InvalidParams(_) => StatusCode::InvalidParams,
        Error::ObjectNotFound(_) => StatusCode::ObjectNotFound,
        Error::ObjectAlreadyExists(_) => StatusCode::ObjectAlreadyExists,
        Error::ObjectHasLease(_) => StatusCode::ObjectHasLease,
        Error::ReplicaIsNotReady(_) => StatusCode::ReplicaIsNotReady,
        Error::InvalidWrite(_) => StatusCode::InvalidWrite,
        Error::InvalidReplica(_) => StatusCode::InvalidReplica,
        Error::NoAvailableHandle { .. } => StatusCode::NoAvailableHandle,
        Error::SegmentNotFound(_) => StatusCode::SegmentNotFound,
        Error::SegmentAlreadyExists(_) => StatusCode::SegmentAlreadyExists,
        Error::TransferFail(_) => StatusCode::TransferFail,
        Error::RpcFail(_) => StatusCode::RpcFail,
        Error::UnavailableInCurrentMode(_) => StatusCode::UnavailableInCurrentMode,
        Error::InternalError(_) => StatusCode::InternalError,
    }
}

fn to_proto_replica(desc: &ReplicaDescriptor) -> mooncake_proto::master::ReplicaDescriptor {
    mooncake_proto::master::ReplicaDescriptor {
        status: match desc.status {
            ReplicaStatus::Processing => ReplicaState::ReplicaProcessing as i32,
            ReplicaStatus::Complete => ReplicaState::ReplicaComplete as i32,
        },
        buffers: desc
            .buffers
            .iter()
            .map(|buffer| mooncake_proto::master::BufferDescriptor {
                segment_name: buffer.segment_name.clone(),
                address: buffer.address,
                size: buffer.size,
                status: match buffer.status {
                    BufferStatus::Complete => BufferState::BufferComplete as i32,
                    BufferStatus::Invalid => BufferState::BufferInvalid as i32,
                },
            })
            .collect(),
    }
}

fn parse_client_id(pair: Option<UuidPair>) -> Result<ClientId, Status> {
    let pair = pair.ok_or_else(|| Status::invalid_argument("missing client_id"))?;
    Ok(ClientId::from_u64_pair(pair.hi, pair.lo))
}

fn parse_segment_id(pair: Option<UuidPair>) -> Result<SegmentId, Status> {
    let pair = pair.ok_or_else(|| Status::invalid_argument("missing segment_id"))?;
    Ok(SegmentId::from_u64_pair(pair.hi, pair.lo))
}

fn parse_segment(segment: Option<mooncake_proto::master::Segment>) -> Result<Segment, Status> {
    let segment = segment.ok_or_else(|| Status::invalid_argument("missing segment"))?;
    Ok(Segment {
        id: parse_segment_id(segment.id)?,
        name: segment.name,
        base: segment.base,
        size: segment.size,
    })
}

#[tonic::async_trait]
impl MasterRpc for MasterRpcService {
    async fn exist_key(
        &self,
        request: Request<ExistKeyRequest>,
    ) -> Result<Response<ExistKeyResponse>, Status> {
        let req = request.into_inner();
        let exists = self.master.exist_key(&req.key).map_err(to_status)?;
        Ok(Response::new(ExistKeyResponse { exists }))
    }

    async fn batch_exist_key(
        &self,
        request: Request<BatchExistKeyRequest>,
    ) -> Result<Response<BatchExistKeyResponse>, Status> {
        let req = request.into_inner();
        let results = self
            .master
            .batch_exist_key(&req.keys)
            .into_iter()
            .map(|result| match result {
                Ok(exists) => ExistKeyResult {
                    status: StatusCode::Ok as i32,
                    exists,
                },
                Err(e) => ExistKeyResult {
                    status: to_code(&e) as i32,
                    exists: false,
                },
            })
            .collect();
        Ok(Response::new(BatchExistKeyResponse { results }))
    }

    async fn get_replica_list(
        &self,
        request: Request<GetReplicaListRequest>,
    ) -> Result<Response<GetReplicaListResponse>, Status> {
        let req = request.into_inner();
        let replicas = self.master.get_replica_list(&req.key).map_err(to_status)?;
        Ok(Response::new(GetReplicaListResponse {
            replicas: replicas.iter().map(to_proto_replica).collect(),
        }))
    }

    async fn batch_get_replica_list(
        &self,
        request: Request<BatchGetReplicaListRequest>,
    ) -> Result<Response<BatchGetReplicaListResponse>, Status> {
        let req = request.into_inner();
        let results = self
            .master
            .batch_get_replica_list(&req.keys)
            .into_iter()
            .map(|result| match result {
                Ok(replicas) => ReplicaListResult {
                    status: StatusCode::Ok as i32,
                    replicas: replicas.iter().map(to_proto_replica).collect(),
                },
                Err(e) => ReplicaListResult {
                    status: to_code(&e) as i32,
                    replicas: Vec::new(),
                },
            })
            .collect();
        Ok(Response::new(BatchGetReplicaListResponse { results }))
    }

    async fn put_start(
        &self,
        request: Request<PutStartRequest>,
    ) -> Result<Response<PutStartResponse>, Status> {
        let req = request.into_inner();
        let config = ReplicateConfig {
            replica_num: req.replica_num as usize,
        };
        let replicas = self
            .master
            .put_start(&req.key, req.value_length, &req.slice_lengths, &config)
            .map_err(to_status)?;
        Ok(Response::new(PutStartResponse {
            replicas: replicas.iter().map(to_proto_replica).collect(),
        }))
    }

    async fn put_end(
        &self,
        request: Request<PutEndRequest>,
    ) -> Result<Response<PutEndResponse>, Status> {
        let req = request.into_inner();
        self.master.put_end(&req.key).map_err(to_status)?;
        Ok(Response::new(PutEndResponse {}))
    }

    async fn put_revoke(
        &self,
        request: Request<PutRevokeRequest>,
    ) -> Result<Response<PutRevokeResponse>, Status> {
        let req = request.into_inner();
        self.master.put_revoke(&req.key).map_err(to_status)?;
        Ok(Response::new(PutRevokeResponse {}))
    }

    async fn batch_put_start(
        &self,
        request: Request<BatchPutStartRequest>,
    ) -> Result<Response<BatchPutStartResponse>, Status> {
        let req = request.into_inner();
        let config = ReplicateConfig {
            replica_num: req.replica_num as usize,
        };
        let slice_lengths: Vec<Vec<u64>> = req
            .slice_lengths
            .into_iter()
            .map(|slices| slices.lengths)
            .collect();
        let results = self
            .master
            .batch_put_start(&req.keys, &req.value_lengths, &slice_lengths, &config)
            .into_iter()
            .map(|result| match result {
                Ok(replicas) => PutStartResult {
                    status: StatusCode::Ok as i32,
                    replicas: replicas.iter().map(to_proto_replica).collect(),
                },
                Err(e) => PutStartResult {
                    status: to_code(&e) as i32,
                    replicas: Vec::new(),
                },
            })
            .collect();
        Ok(Response::new(BatchPutStartResponse { results }))
    }

    async fn batch_put_end(
        &self,
        request: Request<BatchPutEndRequest>,
    ) -> Result<Response<BatchPutEndResponse>, Status> {
        let req = request.into_inner();
        let results = self
            .master
            .batch_put_end(&req.keys)
            .into_iter()
            .map(|result| match result {
                Ok(()) => StatusCode::Ok as i32,
                Err(e) => to_code(&e) as i32,
            })
            .collect();
        Ok(Response::new(BatchPutEndResponse { results }))
    }

    async fn batch_put_revoke(
        &self,
        request: Request<BatchPutRevokeRequest>,
    ) -> Result<Response<BatchPutRevokeResponse>, Status> {
        let req = request.into_inner();
        let results = self
            .master
            .batch_put_revoke(&req.keys)
            .into_iter()
            .map(|result| match result {
                Ok(()) => StatusCode::Ok as i32,
                Err(e) => to_code(&e) as i32,
            })
            .collect();
        Ok(Response::new(BatchPutRevokeResponse { results }))
    }

    async fn remove(
        &self,
        request: Request<RemoveRequest>,
    ) -> Result<Response<RemoveResponse>, Status> {
        let req = request.into_inner();
        self.master.remove(&req.key).map_err(to_status)?;
        Ok(Response::new(RemoveResponse {}))
    }

    async fn remove_all(
        &self,
        _request: Request<RemoveAllRequest>,
    ) -> Result<Response<RemoveAllResponse>, Status> {
        let removed_count = self.master.remove_all();
        Ok(Response::new(RemoveAllResponse { removed_count }))
    }

    async fn mount_segment(
        &self,
        request: Request<MountSegmentRequest>,
    ) -> Result<Response<MountSegmentResponse>, Status> {
        let req = request.into_inner();
        let client_id = parse_client_id(req.client_id)?;
        let segment = parse_segment(req.segment)?;
        self.master
            .mount_segment(segment, client_id)
            .map_err(to_status)?;
        Ok(Response::new(MountSegmentResponse {}))
    }

    async fn unmount_segment(
        &self,
        request: Request<UnmountSegmentRequest>,
    ) -> Result<Response<UnmountSegmentResponse>, Status> {
        let req = request.into_inner();
        let segment_id = parse_segment_id(req.segment_id)?;
        let client_id = parse_client_id(req.client_id)?;
        self.master
            .unmount_segment(segment_id, client_id)
            .map_err(to_status)?;
        Ok(Response::new(UnmountSegmentResponse {}))
    }

    async fn re_mount_segment(
        &self,
        request: Request<ReMountSegmentRequest>,
    ) -> Result<Response<ReMountSegmentResponse>, Status> {
        let req = request.into_inner();
        let client_id = parse_client_id(req.client_id)?;
        let segments = req
            .segments
            .into_iter()
            .map(|segment| parse_segment(Some(segment)))
            .collect::<Result<Vec<_>, _>>()?;
        self.master
            .remount_segment(&segments, client_id)
            .map_err(to_status)?;
        Ok(Response::new(ReMountSegmentResponse {}))
    }

    async fn get_all_keys(
        &self,
        _request: Request<GetAllKeysRequest>,
    ) -> Result<Response<GetAllKeysResponse>, Status> {
        Ok(Response::new(GetAllKeysResponse {
            keys: self.master.get_all_keys(),
        }))
    }

    async fn get_all_segments(
        &self,
        _request: Request<GetAllSegmentsRequest>,
    ) -> Result<Response<GetAllSegmentsResponse>, Status> {
        Ok(Response::new(GetAllSegmentsResponse {
            segment_names: self.master.get_all_segments(),
        }))
    }

    async fn query_segments(
        &self,
        request: Request<QuerySegmentsRequest>,
    ) -> Result<Response<QuerySegmentsResponse>, Status> {
        let req = request.into_inner();
        let (used, capacity) = self
            .master
            .query_segment(&req.segment_name)
            .map_err(to_status)?;
        Ok(Response::new(QuerySegmentsResponse { used, capacity }))
    }

    async fn ping(
        &self,
        request: Request<PingRequest>,
    ) -> Result<Response<PingResponse>, Status> {
        let req = request.into_inner();
        let client_id = parse_client_id(req.client_id)?;
        let (view_version, status) = self.master.ping(client_id).map_err(to_status)?;
        Ok(Response::new(PingResponse {
            view_version,
            status: match status {
                ClientStatus::Ok => ClientState::ClientOk as i32,
                ClientStatus::NeedRemount => ClientState::ClientNeedRemount as i32,
            },
        }))
    }

    async fn get_fsdir(
        &self,
        _request: Request<GetFsdirRequest>,
    ) -> Result<Response<GetFsdirResponse>, Status> {
        let cluster_id = self.master.get_fsdir().map_err(to_status)?;
        Ok(Response::new(GetFsdirResponse { cluster_id }))
    }
}
