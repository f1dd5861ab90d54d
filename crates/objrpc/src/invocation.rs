//! Invocation engine
//!
//! Turns (reference, operation, arguments) into a request and delivers it
//! according to the reference's mode: collocated when an adapter of the
//! same communicator hosts the target, otherwise over a pooled connection.

use crate::adapter::AdapterShared;
use crate::batch::BatchMode;
use crate::communicator::Instance;
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::{Result, RpcError, UserException};
use crate::reference::{filter_endpoints, Reference};
use bytes::Bytes;
use objrpc_wire::{Context, ReplyOutcome, RequestFrame, RequestTarget};
use std::sync::Arc;
use tracing::{debug, trace};

/// Invoke `operation` on the object `reference` designates.
///
/// `context` overrides the reference's context for this call only.
/// Returns the marshaled results for twoway calls and empty bytes for
/// every other mode.
pub(crate) async fn invoke(
    instance: &Arc<Instance>,
    reference: &Reference,
    operation: &str,
    params: Bytes,
    context: Option<&Context>,
) -> Result<Bytes> {
    instance.check_alive()?;

    let mut request = RequestFrame::new(reference.identity.clone(), operation);
    request.facet = reference.facet.clone();
    request.mode = reference.mode;
    request.context = context.unwrap_or(&reference.context).clone();
    request.params = params;

    if reference.collocation_optimized {
        if let Some(adapter) = instance.find_collocated(reference) {
            trace!("Collocated `{}` on {}", operation, reference.identity);
            return invoke_collocated(&adapter, reference, request).await;
        }
    }

    let connection = connection_for(instance, reference).await?;
    dispatch_over(&connection, reference, request).await
}

/// Endpoints for `reference`, resolving indirect references through the
/// locator
pub(crate) async fn resolve_endpoints(
    instance: &Instance,
    reference: &Reference,
) -> Result<Vec<Endpoint>> {
    let adapter_id = match &reference.adapter_id {
        Some(adapter_id) => adapter_id,
        None => return Ok(reference.endpoints.clone()),
    };
    let locator = instance
        .locator()
        .ok_or_else(|| RpcError::NotRegistered(adapter_id.clone()))?;
    let endpoints = locator.find_adapter_by_id(adapter_id).await?;
    if endpoints.is_empty() {
        return Err(RpcError::NotRegistered(adapter_id.clone()));
    }
    debug!("Resolved adapter `{}` to {} endpoints", adapter_id, endpoints.len());
    Ok(endpoints)
}

/// Pooled connection usable for the reference's mode and security
pub(crate) async fn connection_for(
    instance: &Instance,
    reference: &Reference,
) -> Result<Arc<Connection>> {
    let endpoints = resolve_endpoints(instance, reference).await?;
    let usable = filter_endpoints(
        &endpoints,
        reference.mode,
        reference.secure,
        instance.config.prefer_secure,
    );
    if usable.is_empty() {
        return Err(RpcError::NoEndpoint(reference.to_string()));
    }
    instance.pool.get(&usable, reference.secure).await
}

async fn dispatch_over(
    connection: &Connection,
    reference: &Reference,
    request: RequestFrame,
) -> Result<Bytes> {
    if request.mode.is_twoway() {
        let outcome = connection.invoke_twoway(request, reference.timeout).await?;
        return outcome_to_result(outcome);
    }
    match BatchMode::of(request.mode) {
        Some(mode) => connection.queue_batch(mode, request.batch_body()).await?,
        None => connection.send_oneway(request).await?,
    }
    Ok(Bytes::new())
}

async fn invoke_collocated(
    adapter: &Arc<AdapterShared>,
    reference: &Reference,
    request: RequestFrame,
) -> Result<Bytes> {
    if let Some(mode) = BatchMode::of(request.mode) {
        adapter.queue_collocated_batch(mode, request)?;
        return Ok(Bytes::new());
    }
    if !request.mode.is_twoway() {
        adapter.dispatch(request).await;
        return Ok(Bytes::new());
    }

    // Dispatch on its own task so a timeout abandons the call without
    // cancelling the servant
    let dispatch = tokio::spawn({
        let adapter = adapter.clone();
        async move { adapter.dispatch(request).await }
    });
    let joined = match reference.timeout {
        Some(limit) => tokio::time::timeout(limit, dispatch)
            .await
            .map_err(|_| RpcError::Timeout(limit))?,
        None => dispatch.await,
    };
    let outcome = joined.map_err(|e| RpcError::Unknown(e.to_string()))?;
    outcome_to_result(outcome)
}

fn not_exist(target: RequestTarget) -> (objrpc_wire::Identity, String, String) {
    (target.identity, target.facet, target.operation)
}

/// Map a reply outcome to the caller's result
pub(crate) fn outcome_to_result(outcome: ReplyOutcome) -> Result<Bytes> {
    match outcome {
        ReplyOutcome::Ok(results) => Ok(results),
        ReplyOutcome::UserException(payload) => Err(RpcError::User(UserException::new(payload))),
        ReplyOutcome::ObjectNotExist(target) => {
            let (identity, facet, operation) = not_exist(target);
            Err(RpcError::ObjectNotExist {
                identity,
                facet,
                operation,
            })
        }
        ReplyOutcome::FacetNotExist(target) => {
            let (identity, facet, operation) = not_exist(target);
            Err(RpcError::FacetNotExist {
                identity,
                facet,
                operation,
            })
        }
        ReplyOutcome::OperationNotExist(target) => {
            let (identity, facet, operation) = not_exist(target);
            Err(RpcError::OperationNotExist {
                identity,
                facet,
                operation,
            })
        }
        ReplyOutcome::UnknownLocalException(reason) => Err(RpcError::UnknownLocal(reason)),
        ReplyOutcome::UnknownUserException(reason) => Err(RpcError::UnknownUser(reason)),
        ReplyOutcome::UnknownException(reason) => Err(RpcError::Unknown(reason)),
    }
}
