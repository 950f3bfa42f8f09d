//! Robot descriptors and family metadata

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Physical or network link to a robot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "address", rename_all = "lowercase")]
pub enum Link {
    /// Serial port path (e.g., "/dev/ttyACM0", "COM3")
    Serial(String),
    /// Host name or IP address (e.g., "10.0.1.1")
    Network(String),
}

impl Link {
    /// The port path or network address
    pub fn address(&self) -> &str {
        match self {
            Link::Serial(port) => port,
            Link::Network(addr) => addr,
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.address())
    }
}

/// Arduino-class boards flashed by an external tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArduinoBoard {
    Uno,
    Nano,
    Mega,
    Bob3,
    Botnroll,
    Mbot,
    Rob3rta,
    UnoWifiRev2,
    Nano33Ble,
    FestoBionic,
}

impl ArduinoBoard {
    /// Identifier used by the programming server
    pub fn server_id(&self) -> &'static str {
        match self {
            ArduinoBoard::Uno => "uno",
            ArduinoBoard::Nano => "nano",
            ArduinoBoard::Mega => "mega",
            ArduinoBoard::Bob3 => "bob3",
            ArduinoBoard::Botnroll => "botnroll",
            ArduinoBoard::Mbot => "mbot",
            ArduinoBoard::Rob3rta => "rob3rta",
            ArduinoBoard::UnoWifiRev2 => "unowifirev2",
            ArduinoBoard::Nano33Ble => "nano33ble",
            ArduinoBoard::FestoBionic => "festobionic",
        }
    }
}

/// Robot family tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RobotFamily {
    Arduino(ArduinoBoard),
    Ev3,
    Mbot2,
    Spike,
    LegoLargeHub,
    Nao,
    Robotino,
}

/// Wire protocol family implementing the upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Flashing tool spawned as a child process (avrdude, bossac, esptool)
    ProcessSpawn,
    /// Brick with an onboard HTTP server
    HttpBinary,
    /// Custom serial bootloader with checksummed frames
    BinaryFrame,
    /// Base64 chunks in JSON messages over serial
    JsonChunk,
    /// Password-authenticated SSH session
    Ssh,
}

/// How a connector (re-)establishes its server session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPolicy {
    /// Every session registers a fresh token
    Register,
    /// An existing token survives robot-side failures and is reused
    ReuseToken,
}

impl RobotFamily {
    /// Value of the `robot` field sent to the server
    pub fn server_id(&self) -> &'static str {
        match self {
            RobotFamily::Arduino(board) => board.server_id(),
            RobotFamily::Ev3 => "ev3",
            RobotFamily::Mbot2 => "mbot2",
            RobotFamily::Spike => "spike",
            RobotFamily::LegoLargeHub => "robotinventor",
            RobotFamily::Nao => "nao",
            RobotFamily::Robotino => "robotino",
        }
    }

    /// Value of the `firmwarename` field sent to the server
    pub fn firmware_name(&self) -> &'static str {
        match self {
            RobotFamily::Arduino(ArduinoBoard::FestoBionic) => "esp32",
            RobotFamily::Arduino(_) => "arduino",
            RobotFamily::Ev3 => "ev3lejosv1",
            RobotFamily::Mbot2 => "mbot2",
            RobotFamily::Spike => "spike",
            RobotFamily::LegoLargeHub => "robotinventor",
            RobotFamily::Nao => "nao",
            RobotFamily::Robotino => "robotino",
        }
    }

    pub fn channel_kind(&self) -> ChannelKind {
        match self {
            RobotFamily::Arduino(_) => ChannelKind::ProcessSpawn,
            RobotFamily::Ev3 => ChannelKind::HttpBinary,
            RobotFamily::Mbot2 => ChannelKind::BinaryFrame,
            RobotFamily::Spike | RobotFamily::LegoLargeHub => ChannelKind::JsonChunk,
            RobotFamily::Nao | RobotFamily::Robotino => ChannelKind::Ssh,
        }
    }

    pub fn session_policy(&self) -> SessionPolicy {
        match self.channel_kind() {
            ChannelKind::Ssh => SessionPolicy::ReuseToken,
            _ => SessionPolicy::Register,
        }
    }

    /// Parse a family from its server id (e.g. "uno", "ev3", "nao")
    pub fn from_server_id(id: &str) -> Option<Self> {
        let board = match id {
            "uno" => ArduinoBoard::Uno,
            "nano" => ArduinoBoard::Nano,
            "mega" => ArduinoBoard::Mega,
            "bob3" => ArduinoBoard::Bob3,
            "botnroll" => ArduinoBoard::Botnroll,
            "mbot" => ArduinoBoard::Mbot,
            "rob3rta" => ArduinoBoard::Rob3rta,
            "unowifirev2" => ArduinoBoard::UnoWifiRev2,
            "nano33ble" => ArduinoBoard::Nano33Ble,
            "festobionic" => ArduinoBoard::FestoBionic,
            "ev3" => return Some(RobotFamily::Ev3),
            "mbot2" => return Some(RobotFamily::Mbot2),
            "spike" => return Some(RobotFamily::Spike),
            "robotinventor" => return Some(RobotFamily::LegoLargeHub),
            "nao" => return Some(RobotFamily::Nao),
            "robotino" => return Some(RobotFamily::Robotino),
            _ => return None,
        };
        Some(RobotFamily::Arduino(board))
    }
}

impl fmt::Display for RobotFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.server_id())
    }
}

/// A detected robot
///
/// Immutable once detected. Two descriptors are equal when they name the
/// same family on the same port or address; the display name and the
/// wireless flag do not take part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Robot {
    /// Display name
    pub name: String,
    /// Family tag
    pub family: RobotFamily,
    /// Serial port or network address
    pub link: Link,
    /// Whether the robot is reached over a wireless link
    #[serde(default)]
    pub wireless: bool,
}

impl Robot {
    pub fn new(name: impl Into<String>, family: RobotFamily, link: Link) -> Self {
        Self {
            name: name.into(),
            family,
            link,
            wireless: false,
        }
    }

    pub fn wireless(mut self, wireless: bool) -> Self {
        self.wireless = wireless;
        self
    }
}

impl PartialEq for Robot {
    fn eq(&self, other: &Self) -> bool {
        self.family == other.family && self.link == other.link
    }
}

impl Eq for Robot {}

impl Hash for Robot {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.family.hash(state);
        self.link.hash(state);
    }
}

impl fmt::Display for Robot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} @ {})", self.name, self.family, self.link)
    }
}
