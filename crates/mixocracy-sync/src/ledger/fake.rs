// In-memory ledger used by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Address, LedgerError, LedgerTrack, TrackId, TxHash, VoteLedger};

#[derive(Debug, Clone)]
struct Song {
    name: String,
    votes: u64,
    removed: bool,
}

#[derive(Debug, Default)]
struct State {
    songs: HashMap<Address, Vec<Song>>,
    voted: HashSet<(Address, Address, TrackId)>,
    active: Vec<Address>,
    fail_batched: bool,
    fail_reads: bool,
    fail_writes: Option<LedgerError>,
    calls: Vec<String>,
}

pub struct FakeLedger {
    pub account: Address,
    state: Mutex<State>,
}

pub fn addr(last: u8) -> Address {
    let mut bytes = [0u8; 20];
    bytes[19] = last;
    Address::from_bytes(bytes)
}

impl FakeLedger {
    pub fn new(account: Address) -> Self {
        Self {
            account,
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_songs(self, target: Address, songs: &[(&str, u64)]) -> Self {
        {
            let mut s = self.state.lock().unwrap();
            let list = s.songs.entry(target).or_default();
            for (name, votes) in songs {
                list.push(Song {
                    name: name.to_string(),
                    votes: *votes,
                    removed: false,
                });
            }
            s.active.push(target);
        }
        self
    }

    pub fn set_votes(&self, target: Address, id: TrackId, votes: u64) {
        let mut s = self.state.lock().unwrap();
        if let Some(song) = s.songs.get_mut(&target).and_then(|l| l.get_mut(id.0 as usize)) {
            song.votes = votes;
        }
    }

    pub fn mark_removed(&self, target: Address, id: TrackId) {
        let mut s = self.state.lock().unwrap();
        if let Some(song) = s.songs.get_mut(&target).and_then(|l| l.get_mut(id.0 as usize)) {
            song.removed = true;
        }
    }

    pub fn set_active(&self, active: Vec<Address>) {
        self.state.lock().unwrap().active = active;
    }

    pub fn fail_batched(&self, fail: bool) {
        self.state.lock().unwrap().fail_batched = fail;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().unwrap().fail_reads = fail;
    }

    pub fn fail_writes(&self, err: Option<LedgerError>) {
        self.state.lock().unwrap().fail_writes = err;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn read<T>(
        &self,
        call: String,
        f: impl FnOnce(&State) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(call);
        if s.fail_reads {
            return Err(LedgerError::Unavailable("fake read failure".into()));
        }
        f(&*s)
    }

    fn song<'a>(s: &'a State, target: Address, id: TrackId) -> Result<&'a Song, LedgerError> {
        s.songs
            .get(&target)
            .and_then(|l| l.get(id.0 as usize))
            .ok_or_else(|| LedgerError::Rejected {
                reason: "SONG_NOT_FOUND".into(),
            })
    }
}

#[async_trait]
impl VoteLedger for FakeLedger {
    async fn vote(&self, target: Address, id: TrackId) -> Result<TxHash, LedgerError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(format!("vote {id}"));
        if let Some(e) = s.fail_writes.clone() {
            return Err(e);
        }
        if !s.voted.insert((self.account, target, id)) {
            return Err(LedgerError::AlreadyVoted(id));
        }
        if let Some(song) = s.songs.get_mut(&target).and_then(|l| l.get_mut(id.0 as usize)) {
            song.votes += 1;
        }
        Ok(TxHash(format!("0xvote{}", id.0)))
    }

    async fn unvote(&self, target: Address, id: TrackId) -> Result<TxHash, LedgerError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(format!("unvote {id}"));
        if let Some(e) = s.fail_writes.clone() {
            return Err(e);
        }
        if !s.voted.remove(&(self.account, target, id)) {
            return Err(LedgerError::NotVoted(id));
        }
        if let Some(song) = s.songs.get_mut(&target).and_then(|l| l.get_mut(id.0 as usize)) {
            song.votes = song.votes.saturating_sub(1);
        }
        Ok(TxHash(format!("0xunvote{}", id.0)))
    }

    async fn query_tally(&self, target: Address, id: TrackId) -> Result<u64, LedgerError> {
        self.read(format!("tally {id}"), |s| Ok(Self::song(s, target, id)?.votes))
    }

    async fn query_has_voted(
        &self,
        voter: Address,
        target: Address,
        id: TrackId,
    ) -> Result<bool, LedgerError> {
        self.read(format!("has_voted {id}"), |s| {
            Ok(s.voted.contains(&(voter, target, id)))
        })
    }

    async fn list_queue(&self, target: Address) -> Result<Vec<LedgerTrack>, LedgerError> {
        self.read("list_queue".into(), |s| {
            if s.fail_batched {
                return Err(LedgerError::Unavailable("batched read failed".into()));
            }
            Ok(s.songs
                .get(&target)
                .map(|l| {
                    l.iter()
                        .enumerate()
                        .filter(|(_, song)| !song.removed)
                        .map(|(i, song)| LedgerTrack {
                            id: TrackId(i as u64),
                            name: song.name.clone(),
                            votes: song.votes,
                            removed: false,
                        })
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    async fn song_count(&self, target: Address) -> Result<u64, LedgerError> {
        self.read("song_count".into(), |s| {
            Ok(s.songs.get(&target).map(|l| l.len() as u64).unwrap_or(0))
        })
    }

    async fn song_name(&self, target: Address, id: TrackId) -> Result<String, LedgerError> {
        self.read(format!("song_name {id}"), |s| {
            Ok(Self::song(s, target, id)?.name.clone())
        })
    }

    async fn is_song_removed(&self, target: Address, id: TrackId) -> Result<bool, LedgerError> {
        self.read(format!("is_removed {id}"), |s| {
            Ok(Self::song(s, target, id)?.removed)
        })
    }

    async fn add_track(&self, name: &str) -> Result<TxHash, LedgerError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(format!("add {name}"));
        if let Some(e) = s.fail_writes.clone() {
            return Err(e);
        }
        let list = s.songs.entry(self.account).or_default();
        list.push(Song {
            name: name.to_string(),
            votes: 0,
            removed: false,
        });
        Ok(TxHash(format!("0xadd{}", list.len() - 1)))
    }

    async fn remove_track(&self, id: TrackId) -> Result<TxHash, LedgerError> {
        let account = self.account;
        self.mark_removed(account, id);
        self.state.lock().unwrap().calls.push(format!("remove {id}"));
        Ok(TxHash(format!("0xremove{}", id.0)))
    }

    async fn active_djs(&self) -> Result<Vec<Address>, LedgerError> {
        self.read("active_djs".into(), |s| Ok(s.active.clone()))
    }

    async fn is_set_active(&self, target: Address) -> Result<bool, LedgerError> {
        self.read("is_set_active".into(), |s| Ok(s.active.contains(&target)))
    }

    async fn start_set(&self, target: Address) -> Result<TxHash, LedgerError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push("start_set".into());
        if !s.active.contains(&target) {
            s.active.push(target);
        }
        Ok(TxHash("0xstart".into()))
    }

    async fn stop_set(&self, target: Address) -> Result<TxHash, LedgerError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push("stop_set".into());
        s.active.retain(|a| *a != target);
        Ok(TxHash("0xstop".into()))
    }
}
