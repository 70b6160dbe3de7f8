use bitflags::bitflags;

/// Default ATT MTU ([Vol 3] Part F, Section 3.2.8).
pub const MIN_MTU: u16 = 23;

/// Maximum ATT MTU accepted by the host (512-byte value plus the 5-byte
/// prepare write header).
pub const MAX_MTU: u16 = 517;

/// GATT operation status reported by the transport or the simulated peer. The
/// values match the ATT error codes ([Vol 3] Part F, Section 3.4.1.1) where
/// applicable, and the host stack codes otherwise. Unknown codes are mapped to
/// [`Status::Failure`].
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    Hash,
    PartialEq,
    num_enum::FromPrimitive,
    num_enum::IntoPrimitive,
    strum::Display,
)]
#[non_exhaustive]
#[repr(u16)]
pub enum Status {
    Success = 0x0000,
    InvalidHandle = 0x0001,
    ReadNotPermitted = 0x0002,
    WriteNotPermitted = 0x0003,
    InsufficientAuthentication = 0x0005,
    RequestNotSupported = 0x0006,
    InvalidOffset = 0x0007,
    InsufficientAuthorization = 0x0008,
    InvalidAttributeValueLength = 0x000D,
    InsufficientEncryption = 0x000F,
    Error = 0x0085,
    ConnectionCongested = 0x008F,
    #[default]
    Failure = 0x0101,
}

impl Status {
    /// Returns whether the status indicates success.
    #[inline(always)]
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Connection state change status. Uses HCI error codes
/// ([Vol 1] Part F, Section 1.3) with a generic fallback.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    Hash,
    PartialEq,
    num_enum::FromPrimitive,
    num_enum::IntoPrimitive,
    strum::Display,
)]
#[non_exhaustive]
#[repr(u16)]
pub enum ConnStatus {
    Success = 0x00,
    /// Link supervision timeout.
    LinkLoss = 0x08,
    /// The remote device terminated the connection gracefully.
    TerminatePeerUser = 0x13,
    /// The local host terminated the connection.
    TerminateLocalHost = 0x16,
    /// Connection could not be established.
    FailedToEstablish = 0x3E,
    #[default]
    Error = 0x85,
}

impl ConnStatus {
    /// Returns whether the status indicates a graceful disconnection initiated
    /// by the peer.
    #[inline(always)]
    #[must_use]
    pub const fn is_peer_graceful(self) -> bool {
        matches!(self, Self::TerminatePeerUser)
    }
}

/// Connection phase.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize,
    strum::Display,
)]
#[non_exhaustive]
pub enum ConnState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// LE physical layer ([Vol 6] Part B, Section 2).
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
    serde::Deserialize,
    serde::Serialize,
    strum::Display,
)]
#[repr(u8)]
pub enum Phy {
    #[default]
    Le1M = 1,
    Le2M = 2,
    LeCoded = 3,
}

bitflags! {
    /// Preferred PHY mask.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct PhyMask: u8 {
        const LE_1M = 1 << 0;
        const LE_2M = 1 << 1;
        const LE_CODED = 1 << 2;
    }
}

impl PhyMask {
    /// Returns the PHY selected from the mask, preferring higher throughput.
    /// Returns `None` if the mask is empty.
    #[inline]
    #[must_use]
    pub const fn select(self) -> Option<Phy> {
        if self.contains(Self::LE_2M) {
            Some(Phy::Le2M)
        } else if self.contains(Self::LE_1M) {
            Some(Phy::Le1M)
        } else if self.contains(Self::LE_CODED) {
            Some(Phy::LeCoded)
        } else {
            None
        }
    }
}

impl From<Phy> for PhyMask {
    #[inline]
    fn from(p: Phy) -> Self {
        match p {
            Phy::Le1M => Self::LE_1M,
            Phy::Le2M => Self::LE_2M,
            Phy::LeCoded => Self::LE_CODED,
        }
    }
}

/// Coding preference for the LE Coded PHY.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize,
    strum::Display,
)]
pub enum PhyOption {
    #[default]
    NoPreferred,
    S2,
    S8,
}

/// Connection interval priority requested by the client.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize,
    strum::Display,
)]
pub enum Priority {
    #[default]
    Balanced,
    High,
    LowPower,
}

/// Characteristic write procedure ([Vol 3] Part G, Section 4.9).
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, strum::Display)]
pub enum WriteType {
    WithoutResponse,
    #[default]
    WithResponse,
    Signed,
}

impl WriteType {
    /// Returns whether the server must respond to the write.
    #[inline(always)]
    #[must_use]
    pub const fn needs_response(self) -> bool {
        matches!(self, Self::WithResponse)
    }
}

/// Bonding state of the remote device.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize,
    strum::Display,
)]
pub enum BondState {
    #[default]
    None,
    Bonding,
    Bonded,
}

bitflags! {
    /// Characteristic properties ([Vol 3] Part G, Section 3.3.1.1).
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct Prop: u8 {
        /// Permits broadcasts of the Characteristic Value.
        const BROADCAST = 0x01;
        /// Permits reads of the Characteristic Value.
        const READ = 0x02;
        /// Permits writes of the Characteristic Value without response.
        const WRITE_CMD = 0x04;
        /// Permits writes of the Characteristic Value with response.
        const WRITE = 0x08;
        /// Permits notifications of a Characteristic Value without
        /// acknowledgment.
        const NOTIFY = 0x10;
        /// Permits indications of a Characteristic Value with acknowledgment.
        const INDICATE = 0x20;
        /// Permits signed writes to the Characteristic Value.
        const SIGNED_WRITE = 0x40;
        /// Additional properties are in the Extended Properties descriptor.
        const EXT_PROPS = 0x80;
    }
}

impl Prop {
    /// Returns whether the properties permit the specified write type.
    #[inline]
    #[must_use]
    pub const fn permits(self, t: WriteType) -> bool {
        match t {
            WriteType::WithoutResponse => self.contains(Self::WRITE_CMD),
            WriteType::WithResponse => self.contains(Self::WRITE),
            WriteType::Signed => self.contains(Self::SIGNED_WRITE),
        }
    }

    /// Returns whether the client can subscribe to value changes.
    #[inline(always)]
    #[must_use]
    pub const fn can_subscribe(self) -> bool {
        self.intersects(Self::NOTIFY.union(Self::INDICATE))
    }
}

bitflags! {
    /// Client Characteristic Configuration descriptor value
    /// ([Vol 3] Part G, Section 3.3.3.3).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct Cccd: u16 {
        /// The Characteristic Value shall be notified.
        const NOTIFY = 1 << 0;
        /// The Characteristic Value shall be indicated.
        const INDICATE = 1 << 1;
    }
}

impl Cccd {
    /// Returns the descriptor value that enables value updates for a
    /// characteristic with properties `p`, preferring notifications.
    #[inline]
    #[must_use]
    pub const fn enable(p: Prop) -> Self {
        if p.contains(Prop::NOTIFY) {
            Self::NOTIFY
        } else if p.contains(Prop::INDICATE) {
            Self::INDICATE
        } else {
            Self::empty()
        }
    }

    /// Returns the little-endian descriptor value.
    #[inline(always)]
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 2] {
        self.bits().to_le_bytes()
    }
}
