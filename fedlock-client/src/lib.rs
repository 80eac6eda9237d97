use fedlock_core::lock::RawTarget;
use fedlock_core::{DeadlockStats, Error, LockMode, LockTarget, Result, TxnId, TxnOutcome};
use reqwest::{Client as RawClient, Response, StatusCode};
use serde_json::json;

pub struct Client {
    client: RawClient,
    base_url: String,
}

/// A transaction opened on the daemon, whose locks are taken one by one.
pub struct RemoteTxn<'a> {
    client: &'a Client,
    txn_id: TxnId,
}

impl Client {
    /// Create a new fedlock client
    /// - `base_url`: baseurl of the fedlock daemon
    pub fn new(base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/').to_owned();
        Self {
            client: RawClient::new(),
            base_url,
        }
    }

    async fn post(&self, path: &str, txn_id: Option<TxnId>, body: Option<String>) -> Result<String> {
        let target_url = format!("{}/{path}", self.base_url);
        let mut request = self.client.post(target_url);
        if let Some(txn_id) = txn_id {
            request = request.header("X-txn-id", txn_id);
        }
        if let Some(body) = body {
            request = request.body(body);
        }
        let res: Response = request
            .send()
            .await
            .map_err(|e| Error::Client(e.to_string()))?;
        let status = res.status();
        let text = res.text().await.map_err(|e| Error::Client(e.to_string()))?;
        if status != StatusCode::OK {
            return Err(Error::Client(format!("{path} failed with {status}: {text}")));
        }
        Ok(text)
    }

    pub async fn begin_txn(&self) -> Result<RemoteTxn<'_>> {
        let res = self.post("begin-txn", None, None).await?;
        let txn_id = res
            .parse::<TxnId>()
            .map_err(|e| Error::Client(format!("parse txn id failed {:?}", e)))?;
        Ok(RemoteTxn {
            client: self,
            txn_id,
        })
    }

    /// Request `mode` on `target` for `txn_id`. False means the request is
    /// queued, or was rejected by the daemon.
    pub async fn lock(&self, txn_id: TxnId, target: &LockTarget, mode: LockMode) -> Result<bool> {
        let mut body = serde_json::to_value(RawTarget::from(target.clone()))
            .map_err(|e| Error::Client(e.to_string()))?;
        body["mode"] = json!(mode);
        let res = self.post("lock", Some(txn_id), Some(body.to_string())).await?;
        match res.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(Error::Client(format!("invalid lock response: {other}"))),
        }
    }

    pub async fn release(&self, txn_id: TxnId) -> Result<()> {
        self.post("release", Some(txn_id), None).await?;
        Ok(())
    }

    pub async fn abort(&self, txn_id: TxnId) -> Result<()> {
        self.post("abort", Some(txn_id), None).await?;
        Ok(())
    }

    /// Run `statements` as one transaction on the daemon.
    pub async fn execute(&self, statements: &[&str]) -> Result<TxnOutcome> {
        let body = serde_json::to_string(statements).map_err(|e| Error::Client(e.to_string()))?;
        let res = self.post("execute", None, Some(body)).await?;
        serde_json::from_str(&res).map_err(|e| Error::Client(format!("invalid outcome: {e}")))
    }

    pub async fn deadlock_stats(&self) -> Result<DeadlockStats> {
        let res = self.post("deadlocks", None, None).await?;
        serde_json::from_str(&res).map_err(|e| Error::Client(format!("invalid stats: {e}")))
    }
}

impl RemoteTxn<'_> {
    pub fn id(&self) -> TxnId {
        self.txn_id
    }

    pub async fn lock(&self, target: &LockTarget, mode: LockMode) -> Result<bool> {
        self.client.lock(self.txn_id, target, mode).await
    }

    pub async fn release(self) -> Result<()> {
        self.client.release(self.txn_id).await
    }

    pub async fn abort(self) -> Result<()> {
        self.client.abort(self.txn_id).await
    }
}
