// mod.rs — TUF/Uptane metadata: canonical encoding, typed roles, verification

pub mod canonical;
pub mod model;
pub mod verify;
