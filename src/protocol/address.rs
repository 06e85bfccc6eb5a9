//! Hierarchical fleet addresses.
//!
//! Every node in the fleet is identified by a [`SimulatorAddress`]: the
//! coordinator is the root (`C`), agents hang below it (`C_A1`), workers below
//! their agent (`C_A1_W2`) and tests below their worker (`C_A1_W2_T1`). The
//! same type doubles as the routing key for outbound operations, where the
//! `*` wildcard selects every child at one level (`C_A*_W*`).

use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::error::{AppError, AppResult, ProtocolError};

const ROOT_TOKEN: &str = "C";
const WILDCARD_TOKEN: &str = "*";
const SEPARATOR: char = '_';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AddressLevel {
    Root,
    Agent,
    Worker,
    Test,
}

impl AddressLevel {
    #[must_use]
    pub const fn child(self) -> Option<Self> {
        match self {
            AddressLevel::Root => Some(AddressLevel::Agent),
            AddressLevel::Agent => Some(AddressLevel::Worker),
            AddressLevel::Worker => Some(AddressLevel::Test),
            AddressLevel::Test => None,
        }
    }

    #[must_use]
    pub const fn parent(self) -> Option<Self> {
        match self {
            AddressLevel::Root => None,
            AddressLevel::Agent => Some(AddressLevel::Root),
            AddressLevel::Worker => Some(AddressLevel::Agent),
            AddressLevel::Test => Some(AddressLevel::Worker),
        }
    }

    const fn prefix(self) -> char {
        match self {
            AddressLevel::Root => 'C',
            AddressLevel::Agent => 'A',
            AddressLevel::Worker => 'W',
            AddressLevel::Test => 'T',
        }
    }

    const fn depth(self) -> usize {
        match self {
            AddressLevel::Root => 0,
            AddressLevel::Agent => 1,
            AddressLevel::Worker => 2,
            AddressLevel::Test => 3,
        }
    }
}

/// One index slot of an address.
///
/// `Unset` marks a slot below the address level; `All` is the outbound
/// routing wildcard and never appears in a source address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressIndex {
    Unset,
    All,
    At(NonZeroU32),
}

impl AddressIndex {
    /// Builds a concrete 1-based index.
    ///
    /// # Errors
    ///
    /// Returns an error when `index` is zero.
    pub fn at(index: u32) -> AppResult<Self> {
        NonZeroU32::new(index).map(AddressIndex::At).ok_or_else(|| {
            AppError::protocol(ProtocolError::InvalidAddress {
                reason: "indices are 1-based",
            })
        })
    }

    #[must_use]
    pub const fn get(self) -> Option<u32> {
        match self {
            AddressIndex::At(value) => Some(value.get()),
            AddressIndex::Unset | AddressIndex::All => None,
        }
    }

    const fn is_set(self) -> bool {
        !matches!(self, AddressIndex::Unset)
    }

    fn covers(self, other: Self) -> bool {
        match self {
            AddressIndex::All => other.is_set(),
            AddressIndex::At(_) => self == other,
            AddressIndex::Unset => false,
        }
    }
}

impl fmt::Display for AddressIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressIndex::Unset => Ok(()),
            AddressIndex::All => f.write_str(WILDCARD_TOKEN),
            AddressIndex::At(value) => write!(f, "{}", value),
        }
    }
}

/// Immutable address of a fleet member, ordered by `(level, agent, worker, test)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SimulatorAddress {
    level: AddressLevel,
    agent: AddressIndex,
    worker: AddressIndex,
    test: AddressIndex,
}

impl SimulatorAddress {
    /// Builds an address, enforcing that exactly the slots up to `level` are set.
    ///
    /// # Errors
    ///
    /// Returns an error when a slot above the level is unset or a slot below
    /// the level is set.
    pub fn new(
        level: AddressLevel,
        agent: AddressIndex,
        worker: AddressIndex,
        test: AddressIndex,
    ) -> AppResult<Self> {
        let slots = [agent, worker, test];
        for (position, slot) in slots.iter().enumerate() {
            let meaningful = position < level.depth();
            if meaningful != slot.is_set() {
                return Err(AppError::protocol(ProtocolError::InvalidAddress {
                    reason: if meaningful {
                        "index required by address level is unset"
                    } else {
                        "index below address level must be unset"
                    },
                }));
            }
        }
        Ok(Self {
            level,
            agent,
            worker,
            test,
        })
    }

    #[must_use]
    pub const fn root() -> Self {
        Self {
            level: AddressLevel::Root,
            agent: AddressIndex::Unset,
            worker: AddressIndex::Unset,
            test: AddressIndex::Unset,
        }
    }

    /// Address of agent `agent_index`.
    ///
    /// # Errors
    ///
    /// Returns an error when the index is zero.
    pub fn agent(agent_index: u32) -> AppResult<Self> {
        Self::root().child(AddressIndex::at(agent_index)?)
    }

    /// Address of worker `worker_index` on agent `agent_index`.
    ///
    /// # Errors
    ///
    /// Returns an error when either index is zero.
    pub fn worker(agent_index: u32, worker_index: u32) -> AppResult<Self> {
        Self::agent(agent_index)?.child(AddressIndex::at(worker_index)?)
    }

    /// Address of test `test_index` on a worker.
    ///
    /// # Errors
    ///
    /// Returns an error when any index is zero.
    pub fn test(agent_index: u32, worker_index: u32, test_index: u32) -> AppResult<Self> {
        Self::worker(agent_index, worker_index)?.child(AddressIndex::at(test_index)?)
    }

    /// `C_A*`: every agent.
    #[must_use]
    pub const fn all_agents() -> Self {
        Self {
            level: AddressLevel::Agent,
            agent: AddressIndex::All,
            worker: AddressIndex::Unset,
            test: AddressIndex::Unset,
        }
    }

    /// `C_A*_W*`: every worker of every agent.
    #[must_use]
    pub const fn all_workers() -> Self {
        Self {
            level: AddressLevel::Worker,
            agent: AddressIndex::All,
            worker: AddressIndex::All,
            test: AddressIndex::Unset,
        }
    }

    #[must_use]
    pub const fn level(&self) -> AddressLevel {
        self.level
    }

    #[must_use]
    pub const fn agent_index(&self) -> AddressIndex {
        self.agent
    }

    #[must_use]
    pub const fn worker_index(&self) -> AddressIndex {
        self.worker
    }

    #[must_use]
    pub const fn test_index(&self) -> AddressIndex {
        self.test
    }

    /// Returns the address one level up, `None` for the root.
    #[must_use]
    pub const fn parent(&self) -> Option<Self> {
        match self.level {
            AddressLevel::Root => None,
            AddressLevel::Agent => Some(Self::root()),
            AddressLevel::Worker => Some(Self {
                level: AddressLevel::Agent,
                agent: self.agent,
                worker: AddressIndex::Unset,
                test: AddressIndex::Unset,
            }),
            AddressLevel::Test => Some(Self {
                level: AddressLevel::Worker,
                agent: self.agent,
                worker: self.worker,
                test: AddressIndex::Unset,
            }),
        }
    }

    /// Returns the child address at `index` one level down.
    ///
    /// # Errors
    ///
    /// Returns an error for test-level addresses (no children) or an unset index.
    pub fn child(&self, index: AddressIndex) -> AppResult<Self> {
        let Some(level) = self.level.child() else {
            return Err(AppError::protocol(ProtocolError::InvalidAddress {
                reason: "test addresses have no children",
            }));
        };
        let mut next = *self;
        next.level = level;
        match level {
            AddressLevel::Agent => next.agent = index,
            AddressLevel::Worker => next.worker = index,
            AddressLevel::Test => next.test = index,
            AddressLevel::Root => {}
        }
        Self::new(next.level, next.agent, next.worker, next.test)
    }

    /// Returns this address cut down to `level`, `None` when `level` is deeper.
    #[must_use]
    pub const fn truncate(&self, level: AddressLevel) -> Option<Self> {
        if level.depth() > self.level.depth() {
            return None;
        }
        Some(Self {
            level,
            agent: if level.depth() >= 1 {
                self.agent
            } else {
                AddressIndex::Unset
            },
            worker: if level.depth() >= 2 {
                self.worker
            } else {
                AddressIndex::Unset
            },
            test: if level.depth() >= 3 {
                self.test
            } else {
                AddressIndex::Unset
            },
        })
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        [self.agent, self.worker, self.test].contains(&AddressIndex::All)
    }

    /// Rejects wildcard addresses, which are only valid as destinations.
    ///
    /// # Errors
    ///
    /// Returns an error when the address contains a wildcard slot.
    pub fn ensure_concrete(&self) -> AppResult<()> {
        if self.is_wildcard() {
            return Err(AppError::protocol(ProtocolError::WildcardSource {
                address: self.to_string(),
            }));
        }
        Ok(())
    }

    /// Hierarchical containment: `C_A2` contains `C_A2_W3`, `C_A*_W*`
    /// contains every worker, and every address contains itself.
    #[must_use]
    pub fn contains(&self, other: &SimulatorAddress) -> bool {
        if other.level.depth() < self.level.depth() {
            return false;
        }
        let depth = self.level.depth();
        let mine = [self.agent, self.worker, self.test];
        let theirs = [other.agent, other.worker, other.test];
        mine.iter()
            .zip(theirs.iter())
            .take(depth)
            .all(|(slot, candidate)| slot.covers(*candidate))
    }
}

impl Default for SimulatorAddress {
    fn default() -> Self {
        Self::root()
    }
}

impl fmt::Display for SimulatorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(ROOT_TOKEN)?;
        let slots = [
            (AddressLevel::Agent, self.agent),
            (AddressLevel::Worker, self.worker),
            (AddressLevel::Test, self.test),
        ];
        for (level, slot) in slots.iter().take(self.level.depth()) {
            write!(f, "{}{}{}", SEPARATOR, level.prefix(), slot)?;
        }
        Ok(())
    }
}

impl FromStr for SimulatorAddress {
    type Err = AppError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let format_error = |reason: &'static str| {
            AppError::protocol(ProtocolError::AddressFormat {
                input: input.to_owned(),
                reason,
            })
        };

        let mut parts = input.split(SEPARATOR);
        if parts.next() != Some(ROOT_TOKEN) {
            return Err(format_error("address must start with 'C'"));
        }

        let mut address = Self::root();
        for part in parts {
            let Some(level) = address.level.child() else {
                return Err(format_error("too many address segments"));
            };
            let Some(raw) = part.strip_prefix(level.prefix()) else {
                return Err(format_error("unexpected segment prefix"));
            };
            let index = if raw == WILDCARD_TOKEN {
                AddressIndex::All
            } else {
                if raw.is_empty() || !raw.bytes().all(|byte| byte.is_ascii_digit()) {
                    return Err(format_error("index must be a positive integer or '*'"));
                }
                if raw.starts_with('0') {
                    return Err(format_error("index must not have leading zeros"));
                }
                let value = raw
                    .parse::<u32>()
                    .map_err(|_parse_err| format_error("index out of range"))?;
                AddressIndex::at(value).map_err(|_zero_err| format_error("indices are 1-based"))?
            };
            address = address.child(index)?;
        }
        Ok(address)
    }
}

impl Serialize for SimulatorAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SimulatorAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;

        impl de::Visitor<'_> for Visitor {
            type Value = SimulatorAddress;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a simulator address such as C_A1_W2")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                value
                    .parse::<SimulatorAddress>()
                    .map_err(|err| de::Error::custom(err.to_string()))
            }
        }

        deserializer.deserialize_str(Visitor)
    }
}
