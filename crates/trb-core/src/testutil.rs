//! In-crate fakes for the collaborator ports, shared by the unit tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::client::port::{ClientApi, ClientFactory};
use crate::client::types::{ClientEvent, ClientRequest, ClientResponse};
use crate::config::Config;
use crate::domain::{AllowedUser, ChatId, Destination, MessageId, RelayLink, Session, UserId};
use crate::ports::{Broker, Delivery, Store};
use crate::queue::ForwardJob;
use crate::{Error, Result};

/// Config with harmless defaults for unit tests.
pub(crate) fn test_config() -> Config {
    use std::time::Duration;
    Config {
        app_id: 1,
        app_hash: "hash".to_string(),
        bot_id: 999,
        bot_key: "key".to_string(),
        bot_owner: "79000000000".to_string(),
        workers: Vec::new(),
        proxy: None,
        sending_delay: Duration::from_millis(0),
        database_path: "trb-test.sqlite".into(),
        client_dir: "clients".into(),
        bridge_path: "bridge".into(),
        auth_wait_timeout: Duration::from_secs(2),
        secret_ttl: Duration::from_secs(5 * 60),
        name_ttl: Duration::from_secs(24 * 60 * 60),
        sweep_interval: Duration::from_secs(10),
    }
}

// ---------------------------------------------------------------- client

/// Records every submitted request; answers from a scripted queue, falling
/// back to `Ok(ClientResponse::Ok)`.
pub(crate) struct RecordingClient {
    pub key: String,
    pub requests: Mutex<Vec<ClientRequest>>,
    pub script: Mutex<VecDeque<Result<ClientResponse>>>,
    pub closed: AtomicBool,
}

impl RecordingClient {
    fn new(key: &str, script: VecDeque<Result<ClientResponse>>) -> Self {
        Self {
            key: key.to_string(),
            requests: Mutex::new(Vec::new()),
            script: Mutex::new(script),
            closed: AtomicBool::new(false),
        }
    }

    pub fn requests(&self) -> Vec<ClientRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn push_response(&self, response: Result<ClientResponse>) {
        self.script.lock().unwrap().push_back(response);
    }
}

#[async_trait]
impl ClientApi for RecordingClient {
    async fn submit(&self, req: ClientRequest) -> Result<ClientResponse> {
        self.requests.lock().unwrap().push(req);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(ClientResponse::Ok))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Opens [`RecordingClient`] handles and keeps every opened handle plus its
/// event sender around for inspection and event injection.
#[derive(Default)]
pub(crate) struct FakeFactory {
    opened: Mutex<HashMap<String, Vec<Arc<RecordingClient>>>>,
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<ClientEvent>>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest handle opened for `key`.
    pub fn client(&self, key: &str) -> Arc<RecordingClient> {
        self.opened.lock().unwrap()[key].last().unwrap().clone()
    }

    /// Every handle ever opened for `key`, in open order.
    pub fn clients(&self, key: &str) -> Vec<Arc<RecordingClient>> {
        self.opened.lock().unwrap()[key].clone()
    }

    pub fn send_event(&self, key: &str, event: ClientEvent) {
        let senders = self.senders.lock().unwrap();
        senders[key].send(event).unwrap();
    }
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn open(
        &self,
        key: &str,
    ) -> Result<(Arc<dyn ClientApi>, mpsc::UnboundedReceiver<ClientEvent>)> {
        let client = Arc::new(RecordingClient::new(key, VecDeque::new()));
        self.opened
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push(client.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().insert(key.to_string(), tx);
        Ok((client, rx))
    }
}

// ----------------------------------------------------------------- store

#[derive(Default)]
struct StoreState {
    sessions: Vec<Session>,
    links: Vec<RelayLink>,
    destinations: Vec<Destination>,
    forwarded: HashSet<(i64, i64)>,
    users: Vec<AllowedUser>,
    permissions: HashSet<(String, i64)>,
}

/// In-memory [`Store`] with a switch to make every call fail.
#[derive(Default)]
pub(crate) struct MemStore {
    state: Mutex<StoreState>,
    pub fail: AtomicBool,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(Error::Store("induced failure".to_string()))
        } else {
            Ok(())
        }
    }

    pub fn insert_session(&self, session: Session) {
        self.state.lock().unwrap().sessions.push(session);
    }

    pub fn insert_link(&self, link: RelayLink) {
        self.state.lock().unwrap().links.push(link);
    }

    pub fn insert_destination(&self, destination: Destination) {
        self.state.lock().unwrap().destinations.push(destination);
    }

    pub fn insert_user(&self, user: AllowedUser) {
        self.state.lock().unwrap().users.push(user);
    }

    pub fn insert_permission(&self, phone: &str, chat_id: ChatId) {
        self.state
            .lock()
            .unwrap()
            .permissions
            .insert((phone.to_string(), chat_id.0));
    }

    pub fn forwarded_pairs(&self) -> Vec<(i64, i64)> {
        let mut pairs: Vec<_> = self
            .state
            .lock()
            .unwrap()
            .forwarded
            .iter()
            .cloned()
            .collect();
        pairs.sort();
        pairs
    }

    pub fn links(&self) -> Vec<RelayLink> {
        self.state.lock().unwrap().links.clone()
    }

    pub fn user_phones(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .users
            .iter()
            .map(|u| u.phone.clone())
            .collect()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn sessions(&self) -> Result<Vec<Session>> {
        self.guard()?;
        Ok(self.state.lock().unwrap().sessions.clone())
    }

    async fn session_by_phone(&self, phone: &str) -> Result<Option<Session>> {
        self.guard()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .sessions
            .iter()
            .find(|s| s.phone == phone)
            .cloned())
    }

    async fn session_by_client(&self, client_id: UserId) -> Result<Option<Session>> {
        self.guard()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .sessions
            .iter()
            .find(|s| s.client_id == client_id)
            .cloned())
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        self.guard()?;
        let mut state = self.state.lock().unwrap();
        match state
            .sessions
            .iter_mut()
            .find(|s| s.client_id == session.client_id)
        {
            Some(existing) => *existing = session.clone(),
            None => state.sessions.push(session.clone()),
        }
        Ok(())
    }

    async fn links_to_forward(&self, owner: &str, chat_id_from: ChatId) -> Result<Vec<RelayLink>> {
        self.guard()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .links
            .iter()
            .filter(|l| l.owner == owner && l.chat_id_from == chat_id_from)
            .cloned()
            .collect())
    }

    async fn own_links(&self, owner: &str) -> Result<Vec<RelayLink>> {
        self.guard()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .links
            .iter()
            .filter(|l| l.owner == owner)
            .cloned()
            .collect())
    }

    async fn create_link(
        &self,
        owner: &str,
        chat_id_from: ChatId,
        source_title: &str,
        destination: &Destination,
    ) -> Result<()> {
        self.guard()?;
        self.state.lock().unwrap().links.push(RelayLink {
            owner: owner.to_string(),
            chat_id_from,
            chat_id_to: destination.chat_id,
            name: format!("{source_title} -> {}", destination.name),
        });
        Ok(())
    }

    async fn delete_link_by_name(&self, owner: &str, name: &str) -> Result<u64> {
        self.guard()?;
        let mut state = self.state.lock().unwrap();
        let before = state.links.len();
        state.links.retain(|l| !(l.owner == owner && l.name == name));
        Ok((before - state.links.len()) as u64)
    }

    async fn was_forwarded(&self, msg_id: MessageId, chat_id_to: ChatId) -> Result<bool> {
        self.guard()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .forwarded
            .contains(&(msg_id.0, chat_id_to.0)))
    }

    async fn add_forwarded(&self, msg_id: MessageId, chat_id_to: ChatId) -> Result<()> {
        self.guard()?;
        self.state
            .lock()
            .unwrap()
            .forwarded
            .insert((msg_id.0, chat_id_to.0));
        Ok(())
    }

    async fn destinations(&self) -> Result<Vec<Destination>> {
        self.guard()?;
        Ok(self.state.lock().unwrap().destinations.clone())
    }

    async fn destination_by_name(&self, name: &str) -> Result<Option<Destination>> {
        self.guard()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .destinations
            .iter()
            .find(|d| d.name == name)
            .cloned())
    }

    async fn create_destination(&self, chat_id: ChatId, name: &str) -> Result<()> {
        self.guard()?;
        self.state.lock().unwrap().destinations.push(Destination {
            chat_id,
            name: name.to_string(),
        });
        Ok(())
    }

    async fn delete_destination_by_name(&self, name: &str) -> Result<u64> {
        self.guard()?;
        let mut state = self.state.lock().unwrap();
        let before = state.destinations.len();
        state.destinations.retain(|d| d.name != name);
        Ok((before - state.destinations.len()) as u64)
    }

    async fn users(&self) -> Result<Vec<AllowedUser>> {
        self.guard()?;
        Ok(self.state.lock().unwrap().users.clone())
    }

    async fn create_user(&self, phone: &str) -> Result<()> {
        self.guard()?;
        let mut state = self.state.lock().unwrap();
        if state.users.iter().any(|u| u.phone == phone) {
            return Err(Error::Store("duplicate user".to_string()));
        }
        state.users.push(AllowedUser {
            phone: phone.to_string(),
            username: String::new(),
        });
        Ok(())
    }

    async fn delete_user(&self, phone: &str) -> Result<u64> {
        self.guard()?;
        let mut state = self.state.lock().unwrap();
        let before = state.users.len();
        state.users.retain(|u| u.phone != phone);
        Ok((before - state.users.len()) as u64)
    }

    async fn update_user_name(&self, phone: &str, username: &str) -> Result<()> {
        self.guard()?;
        let mut state = self.state.lock().unwrap();
        if let Some(user) = state.users.iter_mut().find(|u| u.phone == phone) {
            user.username = username.to_string();
        }
        Ok(())
    }

    async fn is_phone_allowed(&self, phone: &str) -> Result<bool> {
        self.guard()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .users
            .iter()
            .any(|u| u.phone == phone))
    }

    async fn allowed_destinations(&self, phone: &str) -> Result<Vec<Destination>> {
        self.guard()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .destinations
            .iter()
            .filter(|d| state.permissions.contains(&(phone.to_string(), d.chat_id.0)))
            .cloned()
            .collect())
    }

    async fn allow_destination(&self, destination_name: &str, phone: &str) -> Result<bool> {
        self.guard()?;
        let mut state = self.state.lock().unwrap();
        let Some(chat_id) = state
            .destinations
            .iter()
            .find(|d| d.name == destination_name)
            .map(|d| d.chat_id)
        else {
            return Ok(false);
        };
        state.permissions.insert((phone.to_string(), chat_id.0));
        Ok(true)
    }

    async fn deny_destination(&self, destination_name: &str, phone: &str) -> Result<bool> {
        self.guard()?;
        let mut state = self.state.lock().unwrap();
        let Some(chat_id) = state
            .destinations
            .iter()
            .find(|d| d.name == destination_name)
            .map(|d| d.chat_id)
        else {
            return Ok(false);
        };
        Ok(state.permissions.remove(&(phone.to_string(), chat_id.0)))
    }
}

// ---------------------------------------------------------------- broker

/// In-memory [`Broker`]: FIFO with explicit ack/nack redelivery.
pub(crate) struct MemBroker {
    ready: Mutex<VecDeque<(i64, ForwardJob)>>,
    in_flight: Mutex<HashMap<i64, ForwardJob>>,
    next_tag: AtomicI64,
    notify: Notify,
}

impl Default for MemBroker {
    fn default() -> Self {
        Self {
            ready: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashMap::new()),
            next_tag: AtomicI64::new(1),
            notify: Notify::new(),
        }
    }
}

impl MemBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.ready.lock().unwrap().len() + self.in_flight.lock().unwrap().len()
    }
}

#[async_trait]
impl Broker for MemBroker {
    async fn enqueue(&self, job: &ForwardJob) -> Result<()> {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        self.ready.lock().unwrap().push_back((tag, job.clone()));
        self.notify.notify_one();
        Ok(())
    }

    async fn recv(&self) -> Result<Delivery> {
        loop {
            if let Some((tag, job)) = self.ready.lock().unwrap().pop_front() {
                self.in_flight.lock().unwrap().insert(tag, job.clone());
                return Ok(Delivery { tag, job });
            }
            self.notify.notified().await;
        }
    }

    async fn ack(&self, tag: i64) -> Result<()> {
        self.in_flight.lock().unwrap().remove(&tag);
        Ok(())
    }

    async fn nack(&self, tag: i64) -> Result<()> {
        if let Some(job) = self.in_flight.lock().unwrap().remove(&tag) {
            self.ready.lock().unwrap().push_front((tag, job));
            self.notify.notify_one();
        }
        Ok(())
    }
}
