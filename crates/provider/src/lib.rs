//! Harvester Terraform Provider
//!
//! Implements the Terraform Plugin Protocol v6 for Harvester HCI: virtual
//! machines, volumes, images, networks, load balancers and the rest of the
//! cluster objects a Harvester user manages.

pub mod client;
pub mod config;
pub mod constructor;
pub mod diagnostics;
pub mod importer;
pub mod plugin;
pub mod poll;
pub mod provider;
pub mod resources;
pub mod schema;
pub mod state;
pub mod tls;
pub mod validators;

mod generated {
    pub mod tfplugin6 {
        include!("generated/tfplugin6.rs");
    }
    pub mod plugin {
        include!("generated/plugin.rs");
    }
    pub mod health {
        include!("generated/grpc.health.v1.rs");
    }
}

pub use generated::health;
pub use generated::plugin as plugin_proto;
pub use generated::tfplugin6;
