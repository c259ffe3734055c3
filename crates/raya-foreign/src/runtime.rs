//! Call runtime
//!
//! The dispatch surface used at an actual call boundary. Downcalls resolve a
//! descriptor to its registered stub and jump through it with
//! [`link_to_native`]. Upcalls bind a managed closure to a trampoline inside
//! an [`UpcallScope`], which returns every trampoline it handed out when it
//! is dropped.

use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::abi::Abi;
use crate::adapt::AdaptationPipeline;
use crate::config::ForeignConfig;
use crate::descriptor::{EntryPointCache, LinkOptions, ManagedEntryPoint, NativeEntryPoint};
use crate::error::{programming_error, ForeignError, ForeignResult};
use crate::layout::FunctionType;
use crate::memory::{CodeMemory, OsCodeMemory};
use crate::registry::{BindingId, StubAddress, StubRegistry};
use crate::trampoline::{SpecializationListener, TrampolineAddress, TrampolineAllocator, UpcallClosure};

/// Most argument words `link_to_native` forwards, excluding the bundle
pub const MAX_DISPATCH_WORDS: usize = 12;

static GLOBAL: OnceCell<ForeignRuntime> = OnceCell::new();

/// A resolved downcall: the descriptor and the stub registered for it.
///
/// Passed to the stub as the trailing dispatch argument.
#[derive(Debug, Clone)]
pub struct DowncallBundle {
    descriptor: Arc<NativeEntryPoint>,
    stub: StubAddress,
}

impl DowncallBundle {
    pub fn descriptor(&self) -> &NativeEntryPoint {
        &self.descriptor
    }

    pub fn stub(&self) -> StubAddress {
        self.stub
    }
}

/// Builder for [`ForeignRuntime`]
pub struct ForeignRuntimeBuilder {
    config: ForeignConfig,
    registry: Arc<StubRegistry>,
    listener: Option<SpecializationListener>,
}

impl ForeignRuntimeBuilder {
    pub fn new(registry: StubRegistry) -> Self {
        Self {
            config: ForeignConfig::default(),
            registry: Arc::new(registry),
            listener: None,
        }
    }

    pub fn config(mut self, config: ForeignConfig) -> Self {
        self.config = config;
        self
    }

    /// Callback fired with the binding id after each trampoline specialization
    pub fn on_direct_upcall(mut self, listener: impl Fn(BindingId) + Send + Sync + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Build a runtime backed by OS pages of the configured size
    pub fn build(self) -> ForeignResult<ForeignRuntime> {
        self.config.validate()?;
        let memory = OsCodeMemory::with_page_size(self.config.resolve_page_size());
        self.build_with_memory(memory)
    }

    /// Build a runtime over a custom page provider. The provider's page size
    /// takes precedence over `config.page_size`.
    pub fn build_with_memory<M: CodeMemory>(self, memory: M) -> ForeignResult<ForeignRuntime<M>> {
        let abi = self.config.resolve_abi()?;
        let page_size = memory.page_size();
        if page_size % abi.trampoline_size() != 0 {
            return Err(ForeignError::UnsupportedConfiguration(format!(
                "page size {} is not a multiple of the {}-byte {} trampoline",
                page_size,
                abi.trampoline_size(),
                abi
            )));
        }

        let mut trampolines =
            TrampolineAllocator::with_memory(abi, self.config.isolate_id as usize, self.registry.clone(), memory)
                .with_missing_registration_warnings(self.config.log_missing_registrations);
        if let Some(listener) = self.listener {
            trampolines = trampolines.with_specialization_listener(listener);
        }

        tracing::debug!(
            target: "raya_foreign::runtime",
            %abi,
            page_size,
            downcalls = self.registry.downcall_count(),
            upcalls = self.registry.upcall_count(),
            "foreign runtime ready"
        );
        Ok(ForeignRuntime {
            config: self.config,
            abi,
            registry: self.registry,
            descriptors: EntryPointCache::new(abi),
            trampolines,
            warned: Mutex::new(FxHashSet::default()),
        })
    }
}

/// Run-time entry point for downcalls and upcalls
pub struct ForeignRuntime<M: CodeMemory = OsCodeMemory> {
    config: ForeignConfig,
    abi: Abi,
    registry: Arc<StubRegistry>,
    descriptors: EntryPointCache,
    trampolines: TrampolineAllocator<M>,
    /// Descriptors already reported missing
    warned: Mutex<FxHashSet<NativeEntryPoint>>,
}

impl<M: CodeMemory> fmt::Debug for ForeignRuntime<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignRuntime")
            .field("abi", &self.abi)
            .field("registry", &self.registry)
            .field("pools", &self.trampolines.pool_count())
            .finish()
    }
}

impl ForeignRuntime {
    pub fn builder(registry: StubRegistry) -> ForeignRuntimeBuilder {
        ForeignRuntimeBuilder::new(registry)
    }

    /// Make this runtime the process-wide instance
    pub fn install(self) -> ForeignResult<&'static ForeignRuntime> {
        GLOBAL
            .set(self)
            .map_err(|_| ForeignError::Config("a foreign runtime is already installed".to_string()))?;
        GLOBAL
            .get()
            .ok_or_else(|| ForeignError::Config("foreign runtime installation was lost".to_string()))
    }

    /// The process-wide instance, if one was installed
    pub fn global() -> Option<&'static ForeignRuntime> {
        GLOBAL.get()
    }
}

impl<M: CodeMemory> ForeignRuntime<M> {
    pub fn abi(&self) -> Abi {
        self.abi
    }

    pub fn config(&self) -> &ForeignConfig {
        &self.config
    }

    pub fn registry(&self) -> &StubRegistry {
        &self.registry
    }

    pub fn trampolines(&self) -> &TrampolineAllocator<M> {
        &self.trampolines
    }

    /// Interned downcall descriptor for a C signature
    pub fn downcall_descriptor(
        &self,
        function_type: &FunctionType,
        options: &LinkOptions,
    ) -> ForeignResult<Arc<NativeEntryPoint>> {
        self.descriptors.downcall(function_type, options)
    }

    /// Interned upcall descriptor for a C signature
    pub fn upcall_descriptor(&self, function_type: &FunctionType) -> Arc<ManagedEntryPoint> {
        self.descriptors.upcall(function_type)
    }

    /// Adaptation pipeline a downcall stub for `descriptor` applies
    pub fn adaptation_pipeline(&self, descriptor: &NativeEntryPoint) -> AdaptationPipeline {
        self.abi.build_adaptation_pipeline(descriptor)
    }

    /// Look up the stub for `descriptor`.
    ///
    /// A missing stub is a build configuration error: it is reported with the
    /// caller's location, logged once per descriptor, and never retried.
    #[track_caller]
    pub fn resolve_downcall(&self, descriptor: &Arc<NativeEntryPoint>) -> ForeignResult<DowncallBundle> {
        if let Some(stub) = self.registry.downcall(descriptor) {
            return Ok(DowncallBundle {
                descriptor: descriptor.clone(),
                stub,
            });
        }

        let call_site = Location::caller().to_string();
        if self.config.log_missing_registrations && self.warned.lock().insert((**descriptor).clone()) {
            tracing::warn!(
                target: "raya_foreign::runtime",
                signature = %descriptor.signature(),
                %call_site,
                "no downcall stub registered for this signature; register it at build time"
            );
        }
        Err(ForeignError::MissingRegistration {
            kind: "downcall",
            signature: descriptor.signature().to_string(),
            call_site,
        })
    }

    /// Descriptor and stub for a C signature in one step
    #[track_caller]
    pub fn bind_downcall(&self, function_type: &FunctionType, options: &LinkOptions) -> ForeignResult<DowncallBundle> {
        let descriptor = self.downcall_descriptor(function_type, options)?;
        self.resolve_downcall(&descriptor)
    }

    /// Open a scope that owns the trampolines created in it
    pub fn scope(&self) -> UpcallScope<'_, M> {
        UpcallScope {
            runtime: self,
            trampolines: Mutex::new(Vec::new()),
        }
    }

    /// Create a trampoline for `closure`, owned by `scope`.
    ///
    /// With a `binding`, the trampoline is redirected to the stub specialized
    /// for it when one is registered. The redirect happens here, while the
    /// scope is borrowed and therefore cannot release the trampoline.
    #[track_caller]
    pub fn create_upcall(
        &self,
        scope: &UpcallScope<'_, M>,
        closure: UpcallClosure,
        function_type: &FunctionType,
        binding: Option<BindingId>,
    ) -> ForeignResult<TrampolineAddress> {
        if !std::ptr::eq(scope.runtime, self) {
            programming_error("upcall scope belongs to a different runtime");
        }
        let descriptor = self.upcall_descriptor(function_type);
        let address = self.trampolines.register_for_upcall(closure, &descriptor)?;
        scope.trampolines.lock().push(address);

        if let Some(binding) = binding {
            self.trampolines.patch_for_direct_upcall(address, binding, &descriptor);
        }
        Ok(address)
    }
}

/// Owner of the trampolines created through it; releases them on drop
pub struct UpcallScope<'rt, M: CodeMemory = OsCodeMemory> {
    runtime: &'rt ForeignRuntime<M>,
    trampolines: Mutex<Vec<TrampolineAddress>>,
}

impl<M: CodeMemory> UpcallScope<'_, M> {
    pub fn len(&self) -> usize {
        self.trampolines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<M: CodeMemory> Drop for UpcallScope<'_, M> {
    fn drop(&mut self) {
        let trampolines = std::mem::take(self.trampolines.get_mut());
        if !trampolines.is_empty() {
            tracing::trace!(target: "raya_foreign::runtime", count = trampolines.len(), "closing upcall scope");
        }
        for address in trampolines.into_iter().rev() {
            self.runtime.trampolines.release(address);
        }
    }
}

macro_rules! call_stub {
    (@word $arg:ident) => { u64 };
    ($stub:expr, $bundle:expr; $($arg:ident),*) => {{
        let f: unsafe extern "C" fn($(call_stub!(@word $arg),)* u64) -> u64 = std::mem::transmute($stub);
        f($(*$arg,)* $bundle)
    }};
}

/// Call the stub in `bundle` with `args` followed by the bundle itself.
///
/// `args` are already in dispatch order:
/// `[return buffer] call target [capture buffer] arguments...`.
/// No conversion happens here; each word goes out in the next integer
/// argument position and the stub's integer result is returned.
///
/// # Safety
/// The stub must be a C-ABI function taking `args.len() + 1` words, and the
/// words must be valid for it.
pub unsafe fn link_to_native(args: &[u64], bundle: &DowncallBundle) -> u64 {
    let stub = bundle.stub.as_usize();
    let bundle = bundle as *const DowncallBundle as u64;
    match args {
        [] => call_stub!(stub, bundle;),
        [a0] => call_stub!(stub, bundle; a0),
        [a0, a1] => call_stub!(stub, bundle; a0, a1),
        [a0, a1, a2] => call_stub!(stub, bundle; a0, a1, a2),
        [a0, a1, a2, a3] => call_stub!(stub, bundle; a0, a1, a2, a3),
        [a0, a1, a2, a3, a4] => call_stub!(stub, bundle; a0, a1, a2, a3, a4),
        [a0, a1, a2, a3, a4, a5] => call_stub!(stub, bundle; a0, a1, a2, a3, a4, a5),
        [a0, a1, a2, a3, a4, a5, a6] => call_stub!(stub, bundle; a0, a1, a2, a3, a4, a5, a6),
        [a0, a1, a2, a3, a4, a5, a6, a7] => call_stub!(stub, bundle; a0, a1, a2, a3, a4, a5, a6, a7),
        [a0, a1, a2, a3, a4, a5, a6, a7, a8] => call_stub!(stub, bundle; a0, a1, a2, a3, a4, a5, a6, a7, a8),
        [a0, a1, a2, a3, a4, a5, a6, a7, a8, a9] => {
            call_stub!(stub, bundle; a0, a1, a2, a3, a4, a5, a6, a7, a8, a9)
        }
        [a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10] => {
            call_stub!(stub, bundle; a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10)
        }
        [a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11] => {
            call_stub!(stub, bundle; a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11)
        }
        _ => programming_error(format!(
            "link_to_native supports at most {} argument words, got {}",
            MAX_DISPATCH_WORDS,
            args.len()
        )),
    }
}
