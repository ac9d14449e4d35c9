//! Decrypting blobs in my hand, one layer at a time, last encrypter first.
//!
//! Peers only ever receive layer ids and only ever return keys. The working
//! ciphertext stays here, so nobody else learns which card was drawn.

use super::{PeerSession, SessionEvent};
use crate::error::{Result, RummyError};
use crate::protocol::{KeyRequest, KeyResponse, Message};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use fairdeal_core::{decrypt_one_layer, Card, EncryptedCard, Fingerprint, Layer, LayerId, LayerKey};
use std::collections::{BTreeMap, BTreeSet};

/// Blobs from one round waiting to be decrypted together.
#[derive(Debug, Clone)]
pub(crate) struct DrawJob {
    round: u32,
    /// Encryption order of `round`.
    order: Vec<String>,
    blobs: Vec<EncryptedCard>,
}

#[derive(Debug, Clone)]
pub(crate) struct PendingDraw {
    job: DrawJob,
    working: Vec<EncryptedCard>,
    /// Index into `job.order` of the player whose layer comes off next.
    position: usize,
    awaiting: Option<String>,
    requested_at: Option<DateTime<Utc>>,
    stall_reported: bool,
}

enum DrawStep {
    Request(KeyRequest),
    Continue,
    Finished(Vec<Card>),
}

impl PendingDraw {
    fn new(job: DrawJob) -> Self {
        Self {
            working: job.blobs.clone(),
            position: job.order.len().saturating_sub(1),
            job,
            awaiting: None,
            requested_at: None,
            stall_reported: false,
        }
    }

    pub(crate) fn working_ids(&self) -> Vec<LayerId> {
        self.working.iter().map(|blob| blob.layer_id).collect()
    }

    pub(crate) fn is_waiting_on(&self, peer: &str) -> bool {
        self.awaiting.as_deref() == Some(peer)
    }

    /// Report an unanswered request once it is older than `timeout`.
    pub(crate) fn stall(
        &mut self,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> Option<(String, Vec<LayerId>)> {
        let peer = self.awaiting.clone()?;
        let since = self.requested_at?;
        if self.stall_reported || now - since < timeout {
            return None;
        }
        self.stall_reported = true;
        Some((peer, self.working_ids()))
    }

    /// Remove one layer from every working blob. Returns the cards once the
    /// first encrypter's layer is gone.
    fn peel(&mut self, keys: &BTreeMap<LayerId, LayerKey>) -> Result<Option<Vec<Card>>> {
        let mut wrapped = Vec::with_capacity(self.working.len());
        let mut cards = Vec::with_capacity(self.working.len());

        for blob in &self.working {
            let key = keys
                .get(&blob.layer_id)
                .ok_or(fairdeal_core::CoreError::MissingKey(blob.layer_id))?;
            match decrypt_one_layer(blob, key)? {
                Layer::Wrapped(inner) => wrapped.push(inner),
                Layer::Card(card) => cards.push(card),
            }
        }

        match (self.position, wrapped.is_empty(), cards.is_empty()) {
            (0, true, false) => Ok(Some(cards)),
            (p, false, true) if p > 0 => {
                self.working = wrapped;
                self.position = p - 1;
                self.awaiting = None;
                self.requested_at = None;
                Ok(None)
            }
            (p, _, _) => Err(RummyError::protocol(format!(
                "layers do not match the encryption order at position {}",
                p
            ))),
        }
    }
}

impl<T: Transport> PeerSession<T> {
    /// Queue `blobs` from my hand for decryption, one job per round they
    /// were encrypted in.
    pub(super) async fn request_draw(&mut self, blobs: Vec<EncryptedCard>) -> Result<()> {
        let mut jobs: BTreeMap<u32, DrawJob> = BTreeMap::new();
        for blob in blobs {
            let (round, order) = self.origin_of(&blob)?;
            jobs.entry(round)
                .or_insert_with(|| DrawJob {
                    round,
                    order,
                    blobs: Vec::new(),
                })
                .blobs
                .push(blob);
        }
        for job in jobs.into_values() {
            tracing::debug!("{}: queueing {} blobs of round {}", self.me, job.blobs.len(), job.round);
            self.draw_queue.push_back(job);
        }

        if self.draw.is_some() {
            return Ok(());
        }
        self.advance_draw().await
    }

    /// Round and encryption order of the first table this game that shows
    /// `blob`, which is the round whose chain produced it.
    fn origin_of(&self, blob: &EncryptedCard) -> Result<(u32, Vec<String>)> {
        self.history
            .iter()
            .chain(self.table.iter())
            .find(|table| {
                table
                    .deck
                    .iter()
                    .chain(table.players.values().flat_map(|h| h.encrypted_cards.iter()))
                    .any(|b| b == blob)
            })
            .map(|table| (table.round, table.player_order.clone()))
            .ok_or_else(|| {
                RummyError::invalid_state(format!("blob {} is on no table", blob.fingerprint()))
            })
    }

    pub(super) fn blobs_in_flight(&self) -> BTreeSet<Fingerprint> {
        self.draw
            .iter()
            .map(|d| &d.job)
            .chain(self.draw_queue.iter())
            .flat_map(|job| job.blobs.iter().map(EncryptedCard::fingerprint))
            .collect()
    }

    /// Work through draws until one waits on a peer or none are left.
    async fn advance_draw(&mut self) -> Result<()> {
        let mut failure = None;
        loop {
            if self.draw.is_none() {
                match self.draw_queue.pop_front() {
                    Some(job) => self.draw = Some(PendingDraw::new(job)),
                    None => break,
                }
            }

            match self.step_draw() {
                Ok(DrawStep::Request(request)) => {
                    let to = request.to.clone();
                    tracing::debug!(
                        "{}: asking {} for {} keys of round {}",
                        self.me,
                        to,
                        request.ids.len(),
                        request.round
                    );
                    if let Err(e) = self.send(&to, Message::KeyRequest(request)).await {
                        // picked up again when the link comes back
                        tracing::warn!("{}: key request to {} not sent: {}", self.me, to, e);
                    }
                    break;
                }
                Ok(DrawStep::Continue) => {}
                Ok(DrawStep::Finished(cards)) => self.finish_draw(cards),
                Err(e) => {
                    self.fail_draw(&e);
                    failure.get_or_insert(e);
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Peel my own layer, or produce the request for the next peer's keys.
    fn step_draw(&mut self) -> Result<DrawStep> {
        let me = self.me.clone();
        let draw = self
            .draw
            .as_mut()
            .ok_or_else(|| RummyError::invalid_state("no draw in progress"))?;

        let holder = draw
            .job
            .order
            .get(draw.position)
            .cloned()
            .ok_or_else(|| RummyError::invalid_state("draw position outside the order"))?;
        let ids = draw.working_ids();

        if holder != me {
            draw.awaiting = Some(holder.clone());
            draw.requested_at = Some(Utc::now());
            draw.stall_reported = false;
            return Ok(DrawStep::Request(KeyRequest {
                from: me,
                to: holder,
                round: draw.job.round,
                ids,
            }));
        }

        let secrets = self
            .keys
            .secrets
            .get(draw.job.round as usize)
            .ok_or_else(|| {
                RummyError::invalid_state(format!("no secrets for round {}", draw.job.round))
            })?;
        let keys = secrets.keys_for(&ids)?;
        Ok(match draw.peel(&keys)? {
            Some(cards) => DrawStep::Finished(cards),
            None => DrawStep::Continue,
        })
    }

    pub(super) async fn receive_key_request(&mut self, from: &str, request: KeyRequest) -> Result<()> {
        if request.from != from || request.to != self.me {
            return Err(RummyError::protocol("key request routed wrongly"));
        }
        let secrets = self
            .keys
            .secrets
            .get(request.round as usize)
            .ok_or_else(|| RummyError::protocol(format!("no round {}", request.round)))?;
        let keys = secrets
            .keys_for(&request.ids)
            .map_err(|e| RummyError::protocol(e.to_string()))?;

        tracing::debug!(
            "{}: releasing {} keys of round {} to {}",
            self.me,
            keys.len(),
            request.round,
            from
        );
        self.send(
            from,
            Message::Keys(KeyResponse {
                from: self.me.clone(),
                to: from.to_string(),
                round: request.round,
                keys,
            }),
        )
        .await
    }

    pub(super) async fn receive_keys(&mut self, from: &str, response: KeyResponse) -> Result<()> {
        let expected = self.draw.as_ref().map_or(false, |draw| {
            draw.is_waiting_on(from) && draw.job.round == response.round
        });
        if !expected || response.from != from || response.to != self.me {
            return Err(RummyError::UnexpectedKeys(from.to_string()));
        }

        let peeled = match self.draw.as_mut() {
            Some(draw) => draw.peel(&response.keys),
            None => return Err(RummyError::UnexpectedKeys(from.to_string())),
        };

        let failure = match peeled {
            Ok(Some(cards)) => {
                self.finish_draw(cards);
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("{}: keys from {} did not decrypt: {}", self.me, from, e);
                self.fail_draw(&e);
                Some(e)
            }
        };

        let advanced = self.advance_draw().await;
        match failure {
            Some(e) => Err(e),
            None => advanced,
        }
    }

    /// Send the outstanding request again, e.g. after a reconnect.
    pub(super) async fn resend_key_request(&mut self) {
        let Some(draw) = self.draw.as_mut() else {
            return;
        };
        let Some(to) = draw.awaiting.clone() else {
            return;
        };
        draw.requested_at = Some(Utc::now());
        draw.stall_reported = false;
        let request = KeyRequest {
            from: self.me.clone(),
            to: to.clone(),
            round: draw.job.round,
            ids: draw.working_ids(),
        };
        if let Err(e) = self.send(&to, Message::KeyRequest(request)).await {
            tracing::warn!("{}: key request to {} not sent: {}", self.me, to, e);
        }
    }

    fn finish_draw(&mut self, cards: Vec<Card>) {
        let Some(draw) = self.draw.take() else {
            return;
        };
        for (blob, card) in draw.job.blobs.iter().zip(&cards) {
            self.keys.decrypted.insert(blob.fingerprint(), *card);
        }
        tracing::info!("{}: decrypted {} cards", self.me, cards.len());
        self.emit(SessionEvent::CardsDecrypted {
            encrypted: draw.job.blobs,
            cards,
        });
    }

    fn fail_draw(&mut self, error: &RummyError) {
        if let Some(draw) = self.draw.take() {
            tracing::error!(
                "{}: giving up on {} blobs of round {}: {}",
                self.me,
                draw.job.blobs.len(),
                draw.job.round,
                error
            );
        }
        self.emit(SessionEvent::DrawFailed {
            reason: error.to_string(),
        });
    }
}
