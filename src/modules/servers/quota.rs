/// Whether a guild holding `count` definitions may add one more.
pub const fn can_create(count: usize, max_servers: usize) -> bool {
    count < max_servers
}
