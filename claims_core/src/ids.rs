use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a claim owner. Two reserved ids stand for the server itself
/// and for claims whose player owner expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    pub const SERVER: PlayerId = PlayerId(Uuid::from_u64_pair(0, 0));
    pub const EXPIRED: PlayerId = PlayerId(Uuid::from_u64_pair(0, 1));

    pub fn random() -> Self {
        PlayerId(Uuid::new_v4())
    }

    pub fn from_u128(value: u128) -> Self {
        PlayerId(Uuid::from_u128(value))
    }

    /// True for the server and expired pseudo-owners.
    pub fn is_reserved(self) -> bool {
        self == PlayerId::SERVER || self == PlayerId::EXPIRED
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PlayerId::SERVER => write!(f, "server"),
            PlayerId::EXPIRED => write!(f, "expired"),
            PlayerId(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DimensionId(pub String);

impl DimensionId {
    pub const OVERWORLD: &'static str = "minecraft:overworld";

    pub fn new(name: impl Into<String>) -> Self {
        DimensionId(name.into())
    }

    pub fn overworld() -> Self {
        DimensionId(Self::OVERWORLD.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DimensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    pub fn region(self) -> RegionPos {
        RegionPos::new(self.x >> 5, self.z >> 5)
    }

    /// Cell coordinates inside the owning region.
    pub fn local(self) -> (usize, usize) {
        ((self.x & 31) as usize, (self.z & 31) as usize)
    }

    /// Packs both coordinates into one sortable key.
    pub fn packed(self) -> i64 {
        ((self.x as i64) << 32) | (self.z as u32 as i64)
    }

    pub fn from_packed(value: i64) -> Self {
        Self::new((value >> 32) as i32, value as i32)
    }

    /// Exact for any pair of coordinates; never wraps.
    pub fn chebyshev(self, other: ChunkPos) -> u32 {
        self.x.abs_diff(other.x).max(self.z.abs_diff(other.z))
    }

    pub fn manhattan(self, other: ChunkPos) -> u64 {
        u64::from(self.x.abs_diff(other.x)) + u64::from(self.z.abs_diff(other.z))
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionPos {
    pub x: i32,
    pub z: i32,
}

impl RegionPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    pub fn chunk(self, local_x: usize, local_z: usize) -> ChunkPos {
        ChunkPos::new((self.x << 5) | local_x as i32, (self.z << 5) | local_z as i32)
    }
}
