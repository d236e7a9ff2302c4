use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! newtype_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an instance from an existing identifier string.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Generate a fresh random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Return the inner string as a str slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_id!(PluginId, "Identifies an installed plugin.");
newtype_id!(CapabilityId, "Identifies a single capability declared by a plugin.");
newtype_id!(TriggerDefId, "Identifies a persisted trigger definition.");
newtype_id!(ActionDefId, "Identifies a persisted action definition.");
newtype_id!(PipelineId, "Identifies a pipeline.");
newtype_id!(TriggerEventId, "Identifies one logical trigger firing.");
newtype_id!(InvocationId, "Identifies one attempt to execute an action.");
newtype_id!(BundleId, "Identifies a bundle.");
newtype_id!(FileId, "Identifies a content-addressed file.");
newtype_id!(RecipientId, "Identifies a recipient.");
newtype_id!(AssignmentId, "Identifies a bundle assignment.");
newtype_id!(UserId, "Identifies an admin user.");
newtype_id!(TokenId, "Identifies an API token.");
newtype_id!(DeviceAuthId, "Identifies a CLI device-code grant.");
