//! iofwd - I/O forwarding for parallel simulations
//!
//! Many client processes produce blocks of multidimensional variables; a
//! small set of server processes receives the blocks, merges each variable's
//! blocks into one collective write and commits it to a shared dataset. This
//! keeps the number of processes touching storage small.
//!
//! # Architecture
//!
//! - **Placement** ([`placement`]): clients form an `x * y` grid; servers form
//!   a coarser grid chosen from the factors of the client grid, and each
//!   server owns one rectangular block of clients
//! - **Wire protocol** ([`protocol`]): length-framed messages packed into a
//!   circular buffer ([`ring`])
//! - **Transport** ([`transport`]): a one-sided channel per client. The client
//!   publishes spans of its ring through a handshake mailbox; the server
//!   pulls them with remote reads
//! - **Aggregation** ([`aggregation`]): per-request completion bitmaps and
//!   sub-array merging, dispatched to a [`storage`] backend once every client
//!   of a server has made the same call
//! - **Runtime** ([`runtime`]): [`runtime::init`] assigns the role and wires
//!   the channels; clients call the dataset API, servers run the event loop
//!
//! # Example
//!
//! ```rust,no_run
//! use iofwd::config::IofwdConfig;
//! use iofwd::group::{LocalGroup, ProcessGroup};
//! use iofwd::protocol::DataType;
//! use iofwd::runtime::{init, Role};
//! use iofwd::storage::{MemoryStore, StorageTarget};
//! use iofwd::transport::Fabric;
//!
//! # fn example() -> iofwd::error::IofwdResult<()> {
//! let mut config = IofwdConfig::default();
//! config.placement.client_x = 2;
//! config.placement.client_y = 1;
//! config.placement.ratio = 2;
//!
//! let fabric = Fabric::new();
//! let store = MemoryStore::new();
//! let target = StorageTarget::Memory(store.clone());
//!
//! let threads: Vec<_> = LocalGroup::spawn_world(3)
//!     .into_iter()
//!     .map(|group| {
//!         let (fabric, config, target) = (fabric.clone(), config.clone(), target.clone());
//!         std::thread::spawn(move || -> iofwd::error::IofwdResult<()> {
//!             match init(&group, &fabric, &config, &target)? {
//!                 Role::Client(mut client) => {
//!                     let x = group.rank();
//!                     let file = client.create("/out.nc", 0)?;
//!                     let dim = client.def_dim(file, "x", 2)?;
//!                     let var = client.def_var(file, "v", DataType::Double, &[dim], &[x], &[1])?;
//!                     client.enddef(file)?;
//!                     client.put_vara(file, var, &[x], &[1], &[x as f64])?;
//!                     client.close(file)?;
//!                     client.finalize()?;
//!                 }
//!                 Role::Server(server) => {
//!                     server.run()?;
//!                 }
//!                 Role::Idle => {}
//!             }
//!             Ok(())
//!         })
//!     })
//!     .collect();
//! for thread in threads {
//!     thread.join().expect("rank panicked")?;
//! }
//! assert_eq!(store.snapshot("/out.nc").unwrap().values::<f64>("v"), Some(vec![0.0, 1.0]));
//! # Ok(())
//! # }
//! ```

pub mod aggregation;
pub mod config;
pub mod constants;
pub mod error;
pub mod group;
pub mod id;
pub mod logging;
pub mod placement;
pub mod protocol;
pub mod ring;
pub mod runtime;
pub mod signals;
pub mod storage;
pub mod transport;
