// SPDX-License-Identifier: MPL-2.0

#[path = "0-pd/mod.rs"]
pub mod pd;
#[path = "1-smap/mod.rs"]
pub mod smap;
#[path = "2-omf/mod.rs"]
pub mod omf;
#[path = "3-mdc/mod.rs"]
pub mod mdc;
#[path = "4-pmd/mod.rs"]
pub mod pmd;
