//! Raya Foreign - native call bridging runtime
//!
//! Lets managed code call C functions (downcalls) and lets C code call back
//! into managed closures (upcalls) on x86-64 System V and Windows x64.
//!
//! At build time a C signature is lowered by the host [`Abi`] into a
//! [`NativeEntryPoint`] or [`ManagedEntryPoint`]: the hardware slots and the
//! register or stack location of each. A stub generator emits one stub per
//! distinct descriptor and records it in a [`StubRegistryBuilder`]. At run
//! time [`ForeignRuntime`] only looks stubs up: downcalls jump through
//! [`link_to_native`], upcalls get a trampoline address from an
//! [`UpcallScope`].
//!
//! # Example
//!
//! ```ignore
//! use raya_foreign::{
//!     Abi, ForeignRuntime, FunctionType, LinkOptions, NativeEntryPoint, StubGenerator, StubRegistryBuilder,
//!     ValueLayout,
//! };
//!
//! extern "C" fn c_add(a: i64, b: i64) -> i64 {
//!     a + b
//! }
//!
//! fn run(generator: &dyn StubGenerator) -> raya_foreign::ForeignResult<i64> {
//!     let abi = Abi::host()?;
//!     let add = FunctionType::new(vec![ValueLayout::I64, ValueLayout::I64], Some(ValueLayout::I64));
//!     let mut builder = StubRegistryBuilder::new();
//!     builder.generate_downcall(generator, &NativeEntryPoint::make(abi, &add, &LinkOptions::default())?)?;
//!
//!     let runtime = ForeignRuntime::builder(builder.build()).build()?;
//!     let bundle = runtime.bind_downcall(&add, &LinkOptions::default())?;
//!     let sum = unsafe { raya_foreign::link_to_native(&[c_add as usize as u64, 3, 4], &bundle) };
//!     Ok(sum as i64)
//! }
//! ```

pub mod abi;
pub mod adapt;
pub mod capture;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod layout;
pub mod memory;
pub mod naming;
pub mod registry;
pub mod runtime;
pub mod trampoline;

pub use abi::{Abi, CallingConvention, Register, RegisterClass, SpecialRegisters, Storage};
pub use adapt::{Adaptation, AdaptationPipeline, ArgValue};
pub use capture::{capture_call_state, CapturableState, CaptureMask};
pub use config::ForeignConfig;
pub use descriptor::{Critical, EntryPointCache, LinkOptions, ManagedEntryPoint, NativeEntryPoint};
pub use error::{ForeignError, ForeignResult};
pub use layout::{Carrier, FunctionType, MethodType, StructLayout, ValueLayout};
pub use memory::{os_page_size, CodeMemory, OsCodeMemory};
pub use registry::{BindingId, StubAddress, StubGenerator, StubRegistry, StubRegistryBuilder};
pub use runtime::{link_to_native, DowncallBundle, ForeignRuntime, ForeignRuntimeBuilder, UpcallScope};
pub use trampoline::{TrampolineAddress, TrampolineAllocator, UpcallClosure};
