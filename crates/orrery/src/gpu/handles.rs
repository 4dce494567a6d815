use paste::paste;
use std::num::NonZeroU64;

/// Generates the handle newtypes, the [`GpuObject`] union over all of them, and the typed
/// accessors on [`GpuObject`].
macro_rules! gpu_handles {
    ($($name:ident),* $(,)?) => {
        $(
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(NonZeroU64);

            impl $name {
                pub const fn from_raw(raw: NonZeroU64) -> Self {
                    Self(raw)
                }

                pub const fn raw(self) -> u64 {
                    self.0.get()
                }
            }

            impl From<$name> for GpuObject {
                fn from(handle: $name) -> Self {
                    GpuObject::$name(handle)
                }
            }
        )*

        /// Any API object, tagged with its kind. Cleanup tasks list the objects they release
        /// as `GpuObject`s.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum GpuObject {
            $($name($name)),*
        }

        impl GpuObject {
            pub fn raw(self) -> u64 {
                match self {
                    $(GpuObject::$name(handle) => handle.raw()),*
                }
            }

            pub fn kind(self) -> &'static str {
                match self {
                    $(GpuObject::$name(_) => stringify!($name)),*
                }
            }

            paste! {
                $(
                    pub fn [<as_ $name:snake>](self) -> Option<$name> {
                        match self {
                            GpuObject::$name(handle) => Some(handle),
                            #[allow(unreachable_patterns)]
                            _ => None,
                        }
                    }
                )*
            }
        }
    };
}

gpu_handles! {
    Buffer,
    Image,
    ImageView,
    Sampler,
    Swapchain,
    Framebuffer,
    RenderPass,
    Pipeline,
    DescriptorPool,
    DescriptorSet,
    CommandPool,
    CommandBuffer,
    Semaphore,
    Fence,
}
