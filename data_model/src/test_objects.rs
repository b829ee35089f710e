pub mod tests {
    use crate::NodeId;

    pub const TEST_CLUSTER: &str = "cluster1";
    pub const TEST_MASTER: &str = "db1:3306";
    pub const TEST_SLAVE: &str = "db2:3306";
    pub const TEST_PROXY: &str = "px1:3306";
    pub const TEST_SECRET: &str = "s3cr3t-repl-pass";

    pub fn test_node_id(url: &str) -> NodeId {
        NodeId::parse(url).unwrap()
    }
}
