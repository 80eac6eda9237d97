use bytes::Bytes;
use fedlock_core::lock::RawTarget;
use fedlock_core::{
    AdapterRegistry, Config, Error, LockMode, LockTarget, MemoryAdapter, Result,
    SchemaTranslator, Transaction, TransactionManager, TxnId,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use warp::{
    self,
    http::{self, Response, StatusCode},
    Filter,
};

const LOCK_BODY_LIMIT: u64 = 16 * 1024;
const BATCH_SIZE_LIMIT: u64 = 8 * 1024 * 1024;

/// Body of `/lock`: the target components plus the wanted mode.
#[derive(Deserialize, Serialize, Debug)]
pub struct LockBody {
    #[serde(flatten)]
    pub target: RawTarget,
    pub mode: LockMode,
}

/// Transactions opened through `/begin-txn`, driven lock by lock.
type Sessions = Arc<Mutex<HashMap<TxnId, Arc<Transaction>>>>;

fn status_of(e: &Error) -> StatusCode {
    match e {
        Error::Deadlock { .. } | Error::TxnAborted(_) => StatusCode::CONFLICT,
        Error::LockTimeout(_) => StatusCode::REQUEST_TIMEOUT,
        Error::Translate(_) | Error::InvalidLockLevel(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_reply(e: &Error) -> http::Result<Response<String>> {
    Response::builder().status(status_of(e)).body(e.to_string())
}

fn json_reply<T: Serialize>(value: &T) -> http::Result<Response<String>> {
    match serde_json::to_string(value) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(body),
        Err(e) => Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(format!("cannot serialize reply: {e}")),
    }
}

fn unknown_txn(txn_id: TxnId) -> http::Result<Response<String>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(format!("unknown txn {txn_id}"))
}

/// Transaction manager over in-memory adapters, one per configured storage.
pub fn open_manager(config: &Config) -> Result<TransactionManager> {
    let mut adapters = AdapterRegistry::new();
    for (id, adapter) in MemoryAdapter::for_config(config) {
        adapters.register(id, adapter);
    }
    let translator = Arc::new(SchemaTranslator::new(config.clone()));
    TransactionManager::open(config, translator, adapters)
}

pub fn routes(
    manager: TransactionManager,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let sessions: Sessions = Arc::new(Mutex::new(HashMap::new()));

    let begin_txn = {
        let manager = manager.clone();
        let sessions = sessions.clone();
        warp::post().and(warp::path("begin-txn")).map(move || {
            let txn = manager.begin();
            let txn_id = txn.id();
            sessions.lock().unwrap().insert(txn_id, Arc::new(txn));
            Response::builder()
                .status(StatusCode::OK)
                .body(txn_id.to_string())
        })
    };

    // non-blocking: "false" means queued, ask again to learn about the grant
    let lock = {
        let sessions = sessions.clone();
        warp::post()
            .and(warp::path("lock"))
            .and(warp::body::content_length_limit(LOCK_BODY_LIMIT))
            .and(warp::header::<u64>("X-txn-id"))
            .and(warp::body::bytes())
            .map(move |txn_id, body: Bytes| {
                let response = Response::builder();
                let body: LockBody = match serde_json::from_slice(body.as_ref()) {
                    Ok(body) => body,
                    Err(e) => {
                        return response
                            .status(StatusCode::BAD_REQUEST)
                            .body(format!("unknown lock request format: {e}"))
                    }
                };
                let Some(txn) = sessions.lock().unwrap().get(&txn_id).cloned() else {
                    return unknown_txn(txn_id);
                };
                let target = match LockTarget::try_from(body.target) {
                    Ok(target) => target,
                    Err(e) => {
                        warn!("txn {txn_id} lock request rejected: {e}");
                        return response.status(StatusCode::OK).body("false".to_owned());
                    }
                };
                match txn.submit(&target, body.mode) {
                    Ok(granted) => response.status(StatusCode::OK).body(granted.to_string()),
                    Err(Error::InvalidLockLevel(_)) => {
                        response.status(StatusCode::OK).body("false".to_owned())
                    }
                    Err(e) => {
                        // a killed txn never runs again, drop its session
                        if e.is_abort() {
                            sessions.lock().unwrap().remove(&txn_id);
                        }
                        error_reply(&e)
                    }
                }
            })
    };

    let release = {
        let sessions = sessions.clone();
        warp::post()
            .and(warp::path("release"))
            .and(warp::header::<u64>("X-txn-id"))
            .map(move |txn_id| match sessions.lock().unwrap().remove(&txn_id) {
                Some(txn) => {
                    txn.release();
                    Response::builder()
                        .status(StatusCode::OK)
                        .body("ok".to_owned())
                }
                None => unknown_txn(txn_id),
            })
    };

    let abort = {
        let manager = manager.clone();
        let sessions = sessions.clone();
        warp::post()
            .and(warp::path("abort"))
            .and(warp::header::<u64>("X-txn-id"))
            .map(move |txn_id| {
                // also reaches transactions running on the pool
                manager.abort(txn_id);
                sessions.lock().unwrap().remove(&txn_id);
                Response::builder()
                    .status(StatusCode::OK)
                    .body("ok".to_owned())
            })
    };

    let execute = {
        let manager = manager.clone();
        warp::post()
            .and(warp::path("execute"))
            .and(warp::body::content_length_limit(BATCH_SIZE_LIMIT))
            .and(warp::body::bytes())
            .and_then(move |body: Bytes| {
                let manager = manager.clone();
                async move {
                    let statements: Vec<String> = match serde_json::from_slice(body.as_ref()) {
                        Ok(statements) => statements,
                        Err(e) => {
                            return Ok::<_, Infallible>(
                                Response::builder()
                                    .status(StatusCode::BAD_REQUEST)
                                    .body(format!("unknown statement batch format: {e}")),
                            )
                        }
                    };
                    // lock waits block, keep them off the reactor
                    let res = tokio::task::spawn_blocking(move || manager.execute(&statements))
                        .await
                        .unwrap_or_else(|e| Err(Error::Internal(format!("execute task: {e}"))));
                    Ok(match res {
                        Ok(outcome) => json_reply(&outcome),
                        Err(e) => error_reply(&e),
                    })
                }
            })
    };

    let deadlocks = warp::post()
        .and(warp::path("deadlocks"))
        .map(move || json_reply(&manager.deadlock_stats()));

    begin_txn
        .or(lock)
        .or(release)
        .or(abort)
        .or(execute)
        .or(deadlocks)
}

pub async fn serve(manager: TransactionManager, addr: SocketAddr) {
    info!("fedlock daemon listening on {addr}");
    warp::serve(routes(manager)).run(addr).await;
}

pub async fn start_daemon(config_path: impl AsRef<Path>, addr: SocketAddr) -> Result<()> {
    let config = Config::load(config_path)?;
    let manager = open_manager(&config)?;
    serve(manager, addr).await;
    Ok(())
}
