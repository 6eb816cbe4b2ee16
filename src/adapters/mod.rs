//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter          | Implements          | Connects to                |
//! |------------------|---------------------|----------------------------|
//! | `memory`         | BlobStore           | In-process collections     |
//! |                  | EventStore          |                            |
//! |                  | AlertStore          |                            |
//! |                  | StoragePort         |                            |
//! | `dir_store`      | BlobStore           | JSON files under a dir     |
//! |                  | EventStore          | `events.json`              |
//! |                  | StoragePort         | `.bin` files per key       |
//! | `config_file`    | ConfigPort          | JSON config document       |
//! | `log_sink`       | EventSink           | `log` facade               |
//! | `sim_pump`       | PumpDriver          | Simulated device family    |
//! |                  | AnalyteSource       | Simulated glucose sensor   |
//! | `neutral_stages` | Stage (all seven)   | Inert numeric stand-ins    |
//! | `clock`          | Clock               | System wall clock          |

pub mod clock;
pub mod config_file;
pub mod dir_store;
pub mod log_sink;
pub mod memory;
pub mod neutral_stages;
pub mod sim_pump;
