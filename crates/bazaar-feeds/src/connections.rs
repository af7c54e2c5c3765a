//! Connection requests sent and received by the user.

use std::sync::Arc;

use bazaar_client::{ClientError, EventClass, Filter, Row, Scope, Select};
use bazaar_sync::{
    FeedHealth, FeedOrder, FeedSnapshot, Mutation, MutationOutcome, ReconcilingStore,
    ScopedSubscription,
};
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::records::{ConnectionRequest, ConnectionStatus};
use crate::{FeedContext, FeedError, merge_into, provisional_id};

const TABLE: &str = "connections";

fn side_scope(column: &str, user_id: &str) -> Scope {
    Scope::new(TABLE, EventClass::All).with_filter(Filter::eq(column, user_id))
}

/// Requests where the user is either side, newest first.
///
/// Backed by two scopes (as requester and as addressee) merging into one store.
pub struct ConnectionFeed {
    ctx: FeedContext,
    user_id: String,
    store: ReconcilingStore<ConnectionRequest>,
    outgoing: ScopedSubscription,
    incoming: ScopedSubscription,
}

impl ConnectionFeed {
    #[instrument(skip(ctx))]
    pub async fn open(ctx: FeedContext, user_id: &str) -> Result<Self, FeedError> {
        let store = ReconcilingStore::new(FeedOrder::NewestFirst);
        let outgoing = ScopedSubscription::open(
            ctx.manager(),
            side_scope("requester_id", user_id),
            merge_into(&store, "connections"),
        );
        let incoming = ScopedSubscription::open(
            ctx.manager(),
            side_scope("addressee_id", user_id),
            merge_into(&store, "connections"),
        );

        let feed = Self {
            ctx,
            user_id: user_id.to_string(),
            store,
            outgoing,
            incoming,
        };
        feed.refresh().await?;
        info!(count = feed.store.len(), "connection feed open");
        Ok(feed)
    }

    /// Reload both sides.
    pub async fn refresh(&self) -> Result<(), FeedError> {
        let mut requests = self
            .ctx
            .fetch::<ConnectionRequest>(
                &Select::new(TABLE).filter(Filter::eq("requester_id", &self.user_id)),
            )
            .await?;
        requests.extend(
            self.ctx
                .fetch::<ConnectionRequest>(
                    &Select::new(TABLE).filter(Filter::eq("addressee_id", &self.user_id)),
                )
                .await?,
        );
        self.store.seed(requests);
        Ok(())
    }

    pub fn requests(&self) -> Vec<ConnectionRequest> {
        self.store.records()
    }

    pub fn snapshot(&self) -> FeedSnapshot<ConnectionRequest> {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot<ConnectionRequest>> {
        self.store.subscribe()
    }

    pub fn store(&self) -> &ReconcilingStore<ConnectionRequest> {
        &self.store
    }

    /// Pending requests other users sent to this one.
    pub fn incoming_pending(&self) -> Vec<ConnectionRequest> {
        self.store
            .records()
            .into_iter()
            .filter(|r| r.addressee_id == self.user_id && r.status == ConnectionStatus::Pending)
            .collect()
    }

    /// Pending requests this user sent.
    pub fn outgoing_pending(&self) -> Vec<ConnectionRequest> {
        self.store
            .records()
            .into_iter()
            .filter(|r| r.requester_id == self.user_id && r.status == ConnectionStatus::Pending)
            .collect()
    }

    /// Most recent request between this user and `other`.
    pub fn request_with(&self, other: &str) -> Option<ConnectionRequest> {
        self.store
            .records()
            .into_iter()
            .find(|r| r.involves(other) && r.other_party(&self.user_id) == other)
    }

    pub fn status_with(&self, other: &str) -> Option<ConnectionStatus> {
        self.request_with(other).map(|r| r.status)
    }

    /// Worse of the two scopes' health.
    pub fn health(&self) -> FeedHealth {
        let outgoing = *self.outgoing.health().borrow();
        let incoming = *self.incoming.health().borrow();
        match (outgoing, incoming) {
            (FeedHealth::Degraded, _) | (_, FeedHealth::Degraded) => FeedHealth::Degraded,
            (FeedHealth::Live, other) | (other, FeedHealth::Live) => other,
            (first, _) => first,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.health().is_degraded()
    }

    /// Send a connection request to `other`.
    #[instrument(skip(self))]
    pub async fn connect(&self, other: &str) -> Result<MutationOutcome<ConnectionRequest>, FeedError> {
        if other == self.user_id {
            return Err(FeedError::Validation("cannot connect to yourself".into()));
        }
        match self.status_with(other) {
            Some(ConnectionStatus::Pending) => {
                return Err(FeedError::Validation(format!("request with {} already pending", other)));
            }
            Some(ConnectionStatus::Accepted) => {
                return Err(FeedError::Validation(format!("already connected to {}", other)));
            }
            Some(ConnectionStatus::Declined) | None => {}
        }

        let client_ref = Uuid::new_v4().to_string();
        let provisional = ConnectionRequest {
            id: provisional_id(&client_ref),
            requester_id: self.user_id.clone(),
            addressee_id: other.to_string(),
            status: ConnectionStatus::Pending,
            created_at: Utc::now(),
            client_ref: Some(client_ref.clone()),
        };

        let mut row = Row::new();
        row.insert("requester_id".into(), json!(self.user_id));
        row.insert("addressee_id".into(), json!(other));
        row.insert("status".into(), json!(ConnectionStatus::Pending));
        row.insert("client_ref".into(), json!(client_ref));

        let client = Arc::clone(self.ctx.client());
        let command = async move {
            let stored = client.insert(TABLE, row).await?;
            let request: ConnectionRequest = serde_json::from_value(Value::Object(stored))?;
            Ok::<_, ClientError>(Some(request))
        };

        let outcome = self
            .ctx
            .coordinator()
            .apply(&self.store, Mutation::Insert(provisional), "send connection request", command)
            .await?;
        Ok(outcome)
    }

    /// Withdraw a pending request this user sent.
    #[instrument(skip(self))]
    pub async fn cancel_connect(
        &self,
        request_id: &str,
    ) -> Result<MutationOutcome<ConnectionRequest>, FeedError> {
        let request = self
            .store
            .get(request_id)
            .ok_or_else(|| FeedError::NotInFeed(request_id.to_string()))?;
        if request.requester_id != self.user_id || request.status != ConnectionStatus::Pending {
            return Err(FeedError::Validation(format!(
                "request {} is not a pending outgoing request",
                request_id
            )));
        }

        let client = Arc::clone(self.ctx.client());
        let filters = vec![Filter::eq("id", request_id)];
        let command = async move {
            client.delete(TABLE, &filters).await?;
            Ok::<_, ClientError>(None)
        };

        let outcome = self
            .ctx
            .coordinator()
            .apply(
                &self.store,
                Mutation::remove(request_id),
                "cancel connection request",
                command,
            )
            .await?;
        Ok(outcome)
    }

    /// Accept or decline a pending request sent to this user.
    #[instrument(skip(self))]
    pub async fn respond(
        &self,
        request_id: &str,
        accept: bool,
    ) -> Result<MutationOutcome<ConnectionRequest>, FeedError> {
        let request = self
            .store
            .get(request_id)
            .ok_or_else(|| FeedError::NotInFeed(request_id.to_string()))?;
        if request.addressee_id != self.user_id || request.status != ConnectionStatus::Pending {
            return Err(FeedError::Validation(format!(
                "request {} is not a pending incoming request",
                request_id
            )));
        }

        let status = if accept {
            ConnectionStatus::Accepted
        } else {
            ConnectionStatus::Declined
        };
        let mut patch = Row::new();
        patch.insert("status".into(), json!(status));

        let client = Arc::clone(self.ctx.client());
        let remote_patch = patch.clone();
        let filters = vec![Filter::eq("id", request_id)];
        let command = async move {
            client.update(TABLE, remote_patch, &filters).await?;
            Ok::<_, ClientError>(None)
        };

        let action = if accept {
            "accept connection request"
        } else {
            "decline connection request"
        };
        let outcome = self
            .ctx
            .coordinator()
            .apply(&self.store, Mutation::patch(request_id, patch), action, command)
            .await?;
        Ok(outcome)
    }
}
