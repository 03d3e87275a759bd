//! Everything that happens to a crash after it has been captured.
//!
//! Captures published by [`fault_monitor`] are imported into a [`ReportStore`],
//! which owns their delivery state, and a [`Coordinator`] ties the monitor,
//! the store and a [`SubmissionClient`] together, uploading pending reports
//! from a background thread.
//!
//! ```no_run
//! use crash_reporter::{Coordinator, EndpointConfig};
//!
//! let endpoint = EndpointConfig::from_submission_url(
//!     "https://submit.example.com/my-universe/0123456789abcdef/crash",
//! )
//! .unwrap();
//!
//! let coordinator = Coordinator::builder("/var/lib/my-app/crashes", endpoint)
//!     .start()
//!     .unwrap();
//!
//! if coordinator.crash_loop_detected() {
//!     // start in safe mode
//! }
//! ```

// BEGIN - Embark standard lints v6 for Rust 1.55+
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::flat_map_option,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::from_iter_instead_of_collect,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_digit_groups,
    clippy::large_stack_arrays,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wild_err_arm,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::missing_enforced_import_renames,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::needless_for_each,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::rc_mutex,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::single_match_else,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v6 for Rust 1.55+

pub mod breadcrumbs;
mod config;
mod coordinator;
mod crash_loop;
mod errors;
mod policy;
mod rate_limit;
mod retry;
pub mod store;
mod submit;

pub use breadcrumbs::{
    Breadcrumb, BreadcrumbLevel, BreadcrumbSettings, BreadcrumbType, Breadcrumbs,
};
pub use config::{EndpointConfig, TokenPlacement};
pub use coordinator::{Coordinator, CoordinatorBuilder, CycleStats, RetryOrder, Uploader};
pub use crash_loop::{CrashLoopDetector, Startup};
pub use errors::Error;
pub use policy::{ReportingPolicy, debugger_attached};
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;
pub use store::{DeliveryState, ReportId, ReportStore, Retention, StoreWriter, StoredReport};
pub use submit::{ClientOptions, DeliveryResult, SubmissionClient};
