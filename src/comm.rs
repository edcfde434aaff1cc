//! Rank-to-rank collective channels.
//!
//! Every process of a world joins a root group at startup, rendezvousing
//! over `RANK`/`WORLD_SIZE`/`MASTER_ADDR`/`MASTER_PORT`. Groups are wired
//! as a star around their leader (group rank 0): each collective is one
//! frame from every member to the leader and one frame back. Collectives
//! block until the whole group participates and stragglers are waited
//! for, not timed out.


use std::env::{self, VarError};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, Shutdown, TcpListener, TcpStream};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use itertools::Itertools;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// Position of a process within a group.
pub type Rank = u32;

/// Handle shared between the context's teardown bookkeeping and the
/// work items using the group.
pub type SharedChannel = Arc<Mutex<Channel>>;

/// The coordinating rank of the root group.
pub const COORDINATOR_RANK: Rank = 0;

pub const ENV_RANK: &str = "RANK";
pub const ENV_WORLD_SIZE: &str = "WORLD_SIZE";
pub const ENV_MASTER_ADDR: &str = "MASTER_ADDR";
pub const ENV_MASTER_PORT: &str = "MASTER_PORT";
pub const ENV_CONNECT_TIMEOUT: &str = "MUSTER_CONNECT_TIMEOUT";

pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
pub const DEFAULT_MASTER_PORT: u16 = 29500;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 300;

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(250);
const SUBSET_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum CommError {
    #[error("Rendezvous variable {0} is missing or malformed")]
    Rendezvous(&'static str),
    #[error("Channel i/o failed")]
    Io(#[from] std::io::Error),
    #[error("Frame codec failed")]
    Codec(#[from] bincode::Error),
    #[error("Collective mismatch: expected {expected:?}, got {got:?}")]
    CollectiveMismatch { expected: Op, got: Op },
    #[error("Unexpected hello for member slot {0}")]
    UnexpectedHello(Rank),
    #[error("Broadcast source rank {from} supplied no value")]
    MissingValue { from: Rank },
    #[error("Rank {rank} is outside the group of size {size}")]
    RankOutOfRange { rank: Rank, size: u32 },
    #[error("Invalid member subset: {0}")]
    BadSubset(String),
    #[error("Malformed channel address '{0}'")]
    BadAddress(String),
    #[error("Channel was already torn down")]
    Closed,
}

/// Collective operations as they appear on the wire. The leader checks
/// the tag of every received frame, so ranks disagreeing about which
/// collective runs next fail loudly instead of exchanging garbage.
#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Clone, Copy, Debug)]
#[repr(u8)]
pub enum Op {
    Hello = 0,
    Members = 1,
    Broadcast = 2,
    Barrier = 3,
    Restrict = 4,
}

#[derive(Serialize, Deserialize, Debug)]
struct Frame {
    op: Op,
    payload: Vec<u8>,
}

fn write_frame(stream: &mut TcpStream, frame: &Frame) -> Result<(), CommError> {
    let bytes = bincode::serialize(frame)?;
    stream.write_all(&(bytes.len() as u32).to_be_bytes())?;
    stream.write_all(&bytes)?;
    stream.flush()?;

    Ok(())
}

fn read_frame(stream: &mut TcpStream) -> Result<Frame, CommError> {
    let mut length = [0u8; 4];
    stream.read_exact(&mut length)?;

    let mut bytes = vec![0u8; u32::from_be_bytes(length) as usize];
    stream.read_exact(&mut bytes)?;

    Ok(bincode::deserialize(&bytes)?)
}

/// Read one frame of the running collective from every member, in group
/// rank order.
fn leader_collect(streams: &mut [TcpStream], op: Op) -> Result<Vec<Vec<u8>>, CommError> {
    let mut payloads = Vec::with_capacity(streams.len());
    for stream in streams.iter_mut() {
        let frame = read_frame(stream)?;
        if frame.op != op {
            return Err(CommError::CollectiveMismatch { expected: op, got: frame.op });
        }
        payloads.push(frame.payload);
    }

    Ok(payloads)
}

fn leader_reply(streams: &mut [TcpStream], op: Op, payload: &[u8]) -> Result<(), CommError> {
    for stream in streams.iter_mut() {
        write_frame(stream, &Frame { op, payload: payload.to_vec() })?;
    }

    Ok(())
}

fn member_exchange(stream: &mut TcpStream, op: Op, payload: Vec<u8>) -> Result<Vec<u8>, CommError> {
    write_frame(stream, &Frame { op, payload })?;

    let reply = read_frame(stream)?;
    if reply.op != op {
        return Err(CommError::CollectiveMismatch { expected: op, got: reply.op });
    }

    Ok(reply.payload)
}

fn connect_with_retry(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, CommError> {
    let deadline = Instant::now() + timeout;
    loop {
        match TcpStream::connect((host, port)) {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                if Instant::now() >= deadline {
                    error!(host, port, error = ?error, "Rendezvous timed out: {error}");
                    return Err(error.into());
                }
                trace!(host, port, "rendezvous not ready yet");
                thread::sleep(CONNECT_RETRY_DELAY);
            }
        }
    }
}

fn split_host_port(address: &str) -> Result<(String, u16), CommError> {
    match address.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => Ok((host.to_string(), port)),
            Err(_) => Err(CommError::BadAddress(address.to_string())),
        },
        None => Err(CommError::BadAddress(address.to_string())),
    }
}

fn env_parse<T: FromStr>(key: &'static str, default: T) -> Result<T, CommError> {
    match env::var(key) {
        Ok(value) => value.trim().parse().map_err(|_| CommError::Rendezvous(key)),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(CommError::Rendezvous(key)),
    }
}

/// World coordinates of this process, as handed down by the launcher.
#[derive(Debug, Clone)]
pub struct Bootstrap {
    pub rank: Rank,
    pub world_size: u32,
    pub master_addr: String,
    pub master_port: u16,
    pub connect_timeout: Duration,
}

impl Bootstrap {
    /// Absent rank variables mean a world of one, which makes plain
    /// single-process invocations work without a launcher.
    pub fn from_env() -> Result<Self, CommError> {
        let rank = env_parse(ENV_RANK, 0)?;
        let world_size = env_parse(ENV_WORLD_SIZE, 1)?;
        if world_size == 0 || rank >= world_size {
            return Err(CommError::Rendezvous(ENV_RANK));
        }

        let master_addr = match env::var(ENV_MASTER_ADDR) {
            Ok(addr) => addr,
            Err(VarError::NotPresent) => DEFAULT_MASTER_ADDR.to_string(),
            Err(VarError::NotUnicode(_)) => return Err(CommError::Rendezvous(ENV_MASTER_ADDR)),
        };
        let master_port = env_parse(ENV_MASTER_PORT, DEFAULT_MASTER_PORT)?;
        let connect_timeout =
            Duration::from_secs(env_parse(ENV_CONNECT_TIMEOUT, DEFAULT_CONNECT_TIMEOUT_SECS)?);

        Ok(Bootstrap { rank, world_size, master_addr, master_port, connect_timeout })
    }

    /// Host other members can reach this process under when it leads a
    /// restricted group. A loopback master means a single-host world.
    pub fn advertise_host(&self) -> String {
        if self.master_addr == "localhost" || self.master_addr.starts_with("127.") {
            self.master_addr.clone()
        } else {
            crate::node::hostname().unwrap_or_else(|_| String::from("localhost"))
        }
    }
}

enum Links {
    Solo,
    Leader(Vec<TcpStream>),
    Member(TcpStream),
}

/// One process' endpoint of a process group.
pub struct Channel {
    rank: Rank,
    size: u32,
    world_ranks: Vec<Rank>,
    advertise_host: String,
    links: Links,
    closed: bool,
}

/// Join the root group described by `boot`. The coordinator accepts one
/// connection per member; everyone else dials in and identifies itself.
pub fn connect_root(boot: &Bootstrap) -> Result<Channel, CommError> {
    if boot.world_size == 1 {
        debug!("world of one, using the in-process channel");
        return Ok(Channel::solo(0));
    }

    let world_ranks: Vec<Rank> = (0..boot.world_size).collect();
    let advertise_host = boot.advertise_host();

    if boot.rank == COORDINATOR_RANK {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, boot.master_port))?;
        debug!(
            port = boot.master_port,
            members = boot.world_size - 1,
            "waiting for the world to join"
        );

        let mut members: Vec<Option<TcpStream>> = (1..boot.world_size).map(|_| None).collect();
        let mut joined = 0;
        while joined < members.len() {
            let (mut stream, peer) = listener.accept()?;
            stream.set_nodelay(true)?;

            let hello = read_frame(&mut stream)?;
            if hello.op != Op::Hello {
                return Err(CommError::CollectiveMismatch { expected: Op::Hello, got: hello.op });
            }
            let rank: Rank = bincode::deserialize(&hello.payload)?;
            let slot = rank as usize;
            if slot == 0 || slot >= boot.world_size as usize || members[slot - 1].is_some() {
                return Err(CommError::UnexpectedHello(rank));
            }

            trace!(%peer, rank, "member joined the root group");
            members[slot - 1] = Some(stream);
            joined += 1;
        }

        Ok(Channel {
            rank: COORDINATOR_RANK,
            size: boot.world_size,
            world_ranks,
            advertise_host,
            links: Links::Leader(members.into_iter().flatten().collect()),
            closed: false,
        })
    } else {
        let mut stream = connect_with_retry(&boot.master_addr, boot.master_port, boot.connect_timeout)?;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, &Frame { op: Op::Hello, payload: bincode::serialize(&boot.rank)? })?;
        debug!(rank = boot.rank, master = %boot.master_addr, "joined the root group");

        Ok(Channel {
            rank: boot.rank,
            size: boot.world_size,
            world_ranks,
            advertise_host,
            links: Links::Member(stream),
            closed: false,
        })
    }
}

impl Channel {
    /// Channel of a single-member group. Collectives short-circuit
    /// without touching the network.
    pub fn solo(world_rank: Rank) -> Self {
        Channel {
            rank: 0,
            size: 1,
            world_ranks: vec![world_rank],
            advertise_host: String::from(DEFAULT_MASTER_ADDR),
            links: Links::Solo,
            closed: false,
        }
    }

    pub fn into_shared(self) -> SharedChannel {
        Arc::new(Mutex::new(self))
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Rank of this member in the world the group was carved out of.
    pub fn world_rank(&self) -> Rank {
        self.world_ranks[self.rank as usize]
    }

    pub fn world_ranks(&self) -> &[Rank] {
        &self.world_ranks
    }

    fn ensure_open(&self) -> Result<(), CommError> {
        if self.closed {
            Err(CommError::Closed)
        } else {
            Ok(())
        }
    }

    /// Run one star exchange where a single distinguished rank supplies
    /// the payload every member ends up with.
    fn sourced_exchange(
        &mut self,
        op: Op,
        source: Rank,
        mine: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, CommError> {
        match &mut self.links {
            Links::Solo => mine.ok_or(CommError::MissingValue { from: source }),
            Links::Leader(members) => {
                let contributions = leader_collect(members, op)?;

                let mut chosen = mine;
                for (slot, raw) in contributions.into_iter().enumerate() {
                    let contributed: Option<Vec<u8>> = bincode::deserialize(&raw)?;
                    if let Some(value) = contributed {
                        let rank = slot as Rank + 1;
                        if rank == source {
                            chosen = Some(value);
                        } else {
                            warn!(rank, collective = ?op, "ignoring value from a non-source member");
                        }
                    }
                }

                let value = chosen.ok_or(CommError::MissingValue { from: source })?;
                leader_reply(members, op, &value)?;
                Ok(value)
            }
            Links::Member(leader) => {
                let payload = bincode::serialize(&mine)?;
                member_exchange(leader, op, payload)
            }
        }
    }

    /// World ranks of all group members, in group rank order. Doubles
    /// as a liveness probe since every member has to answer.
    pub fn members(&mut self) -> Result<Vec<Rank>, CommError> {
        self.ensure_open()?;
        let own = self.world_rank();

        match &mut self.links {
            Links::Solo => Ok(vec![own]),
            Links::Leader(streams) => {
                let contributions = leader_collect(streams, Op::Members)?;

                let mut all = Vec::with_capacity(contributions.len() + 1);
                all.push(own);
                for raw in contributions {
                    all.push(bincode::deserialize(&raw)?);
                }

                let payload = bincode::serialize(&all)?;
                leader_reply(streams, Op::Members, &payload)?;
                Ok(all)
            }
            Links::Member(leader) => {
                let payload = bincode::serialize(&own)?;
                let reply = member_exchange(leader, Op::Members, payload)?;
                Ok(bincode::deserialize(&reply)?)
            }
        }
    }

    /// Replicate a value from the member at group rank `from` to the
    /// whole group. Every member, the source included, returns the
    /// value as it came off the wire.
    pub fn broadcast<T>(&mut self, value: Option<T>, from: Rank) -> Result<T, CommError>
    where
        T: Serialize + DeserializeOwned,
    {
        self.ensure_open()?;
        if from >= self.size {
            return Err(CommError::RankOutOfRange { rank: from, size: self.size });
        }
        if self.rank == from && value.is_none() {
            return Err(CommError::MissingValue { from });
        }

        let mine = match (self.rank == from, value) {
            (true, Some(value)) => Some(bincode::serialize(&value)?),
            (false, Some(_)) => {
                warn!(rank = self.rank, from, "dropping broadcast value from a non-source rank");
                None
            }
            (_, None) => None,
        };

        let bytes = self.sourced_exchange(Op::Broadcast, from, mine)?;
        trace!(rank = self.rank, from, bytes = bytes.len(), "broadcast complete");

        Ok(bincode::deserialize(&bytes)?)
    }

    /// Block until every group member has arrived here.
    pub fn barrier(&mut self) -> Result<(), CommError> {
        self.ensure_open()?;
        trace!(rank = self.rank, size = self.size, "entering barrier");

        match &mut self.links {
            Links::Solo => {}
            Links::Leader(streams) => {
                leader_collect(streams, Op::Barrier)?;
                leader_reply(streams, Op::Barrier, &[])?;
            }
            Links::Member(leader) => {
                member_exchange(leader, Op::Barrier, Vec::new())?;
            }
        }

        trace!(rank = self.rank, "left barrier");
        Ok(())
    }

    /// Carve a subgroup out of this group. `ranks` names the members by
    /// their rank in this group and doubles as the new rank order, so
    /// `ranks[0]` leads the subgroup. Every member of this group must
    /// call this collectively; processes outside `ranks` get `None`.
    pub fn restrict(&mut self, ranks: &[Rank]) -> Result<Option<Channel>, CommError> {
        self.ensure_open()?;
        if ranks.is_empty() {
            return Err(CommError::BadSubset(String::from("empty rank list")));
        }
        if !ranks.iter().all_unique() {
            return Err(CommError::BadSubset(format!("duplicate ranks in {ranks:?}")));
        }
        if let Some(&bad) = ranks.iter().find(|&&r| r >= self.size) {
            return Err(CommError::RankOutOfRange { rank: bad, size: self.size });
        }

        let position = ranks.iter().position(|&r| r == self.rank).map(|p| p as Rank);
        let leader_rank = ranks[0];

        // The subgroup leader opens its door before anyone can learn the
        // address through the exchange below.
        let listener = match position {
            Some(0) => Some(TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?),
            _ => None,
        };
        let advertised = match &listener {
            Some(listener) => {
                let address = format!("{}:{}", self.advertise_host, listener.local_addr()?.port());
                Some(bincode::serialize(&address)?)
            }
            None => None,
        };

        let address_bytes = self.sourced_exchange(Op::Restrict, leader_rank, advertised)?;

        let position = match position {
            Some(position) => position,
            None => {
                trace!(rank = self.rank, "not a member of the restricted group");
                return Ok(None);
            }
        };

        let world_ranks: Vec<Rank> = ranks.iter().map(|&r| self.world_ranks[r as usize]).collect();
        if ranks.len() == 1 {
            let mut solo = Channel::solo(world_ranks[0]);
            solo.world_ranks = world_ranks;
            solo.advertise_host = self.advertise_host.clone();
            return Ok(Some(solo));
        }

        let links = match listener {
            Some(listener) => {
                let mut members: Vec<Option<TcpStream>> = (1..ranks.len()).map(|_| None).collect();
                let mut joined = 0;
                while joined < members.len() {
                    let (mut stream, peer) = listener.accept()?;
                    stream.set_nodelay(true)?;

                    let hello = read_frame(&mut stream)?;
                    if hello.op != Op::Hello {
                        return Err(CommError::CollectiveMismatch {
                            expected: Op::Hello,
                            got: hello.op,
                        });
                    }
                    let slot: Rank = bincode::deserialize(&hello.payload)?;
                    let index = slot as usize;
                    if index == 0 || index >= ranks.len() || members[index - 1].is_some() {
                        return Err(CommError::UnexpectedHello(slot));
                    }

                    trace!(%peer, slot, "restricted member joined");
                    members[index - 1] = Some(stream);
                    joined += 1;
                }

                Links::Leader(members.into_iter().flatten().collect())
            }
            None => {
                let address: String = bincode::deserialize(&address_bytes)?;
                let (host, port) = split_host_port(&address)?;

                let mut stream = connect_with_retry(&host, port, SUBSET_CONNECT_TIMEOUT)?;
                stream.set_nodelay(true)?;
                write_frame(
                    &mut stream,
                    &Frame { op: Op::Hello, payload: bincode::serialize(&position)? },
                )?;

                Links::Member(stream)
            }
        };

        debug!(rank = position, size = ranks.len(), "joined restricted group");
        Ok(Some(Channel {
            rank: position,
            size: ranks.len() as u32,
            world_ranks,
            advertise_host: self.advertise_host.clone(),
            links,
            closed: false,
        }))
    }

    /// Synchronize the group once more, then drop the connections. Safe
    /// to call again; later calls do nothing.
    pub fn teardown(&mut self) -> Result<(), CommError> {
        if self.closed {
            debug!(rank = self.rank, "channel already torn down");
            return Ok(());
        }

        let result = self.barrier();
        self.closed = true;

        match &mut self.links {
            Links::Solo => {}
            Links::Leader(streams) => {
                for stream in streams {
                    let _ = stream.shutdown(Shutdown::Both);
                }
            }
            Links::Member(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }

        debug!(rank = self.rank, size = self.size, "channel torn down");
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
