use ethers::contract::abigen;

// Only the functions the client touches. The account itself (execute / executeBatch) is encoded
// in `batch`, because its overloads do not map cleanly onto generated bindings.

abigen!(
    SimpleAccountFactory,
    r#"[
        function createAccount(address owner, uint256 salt) returns (address)
        function getAddress(address owner, uint256 salt) view returns (address)
    ]"#
);

abigen!(
    EntryPoint,
    r#"[
        function getNonce(address sender, uint192 key) view returns (uint256)
    ]"#
);

abigen!(
    Erc20,
    r#"[
        function decimals() view returns (uint8)
        function approve(address spender, uint256 amount) returns (bool)
        function transfer(address to, uint256 amount) returns (bool)
    ]"#
);
