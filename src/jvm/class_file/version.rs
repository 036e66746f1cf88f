use crate::jvm::class_file::{Deserialize, Serialize};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::Result;

/// Version of the class file, which is used to verify that the JVM has the
/// necessary features to interpret the class
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Version {
    pub major_version: u16,
    pub minor_version: u16,
}

impl Version {
    /// Java SE 6, the last version where the type-checking verifier (and so `StackMapTable`) is
    /// optional
    pub const JAVA6: Version = Version {
        major_version: 50,
        minor_version: 0,
    };

    /// Java SE 8 (released March 2014)
    pub const JAVA8: Version = Version {
        major_version: 52,
        minor_version: 0,
    };

    /// Will a JVM accept method bodies without `StackMapTable` frames in this version?
    ///
    /// Class files before version 50 have no frames at all, and version 50 falls back to the old
    /// inferencing verifier when frames are missing or wrong.
    pub fn allows_missing_stack_maps(&self) -> bool {
        self.major_version <= Version::JAVA6.major_version
    }
}

impl Serialize for Version {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.minor_version.serialize(writer)?;
        self.major_version.serialize(writer)?;
        Ok(())
    }
}

impl Deserialize for Version {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        let minor_version = u16::deserialize(reader)?;
        let major_version = u16::deserialize(reader)?;
        Ok(Version {
            major_version,
            minor_version,
        })
    }
}
