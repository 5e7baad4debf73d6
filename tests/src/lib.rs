#[cfg(test)]
mod basic;
#[cfg(test)]
mod batch;
#[cfg(test)]
mod concurrency;
#[cfg(test)]
mod cursor;
#[cfg(test)]
mod wildcards;

#[cfg(test)]
pub(crate) mod util {
    use std::sync::Arc;

    use megaflow::{ClsRule, Flow, Match};

    pub fn rule(build: impl FnOnce(&mut Match), priority: u32) -> Arc<ClsRule> {
        let mut m = Match::new();
        build(&mut m);
        Arc::new(ClsRule::new(&m, priority))
    }

    pub fn tcp_flow(nw_src: u32, tp_dst: u16) -> Flow {
        let mut f = Flow::new();
        f.dl_type = 0x0800;
        f.nw_src = nw_src;
        f.nw_proto = 6;
        f.tp_dst = tp_dst;
        f
    }
}
