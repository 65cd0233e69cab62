mod helpers;

mod crash_recovery;
mod locks;
mod membership;
