//! Contract bindings. Events carry every field the replayer needs; the view
//! functions back the direct-state verification reads.

use ethers::prelude::*;

pub mod client;

abigen!(
    Marketplace,
    r#"[
        event Listed(bytes32 id, address indexed seller, address indexed nft, uint256 tokenId, uint256 price)
        event Cancelled(bytes32 id)
        event Bought(bytes32 id, address indexed buyer, address indexed seller, address indexed nft, uint256 tokenId, uint256 price)
        function listings(bytes32 id) view returns (address seller, address nft, uint256 tokenId, uint256 price, bool active)
    ]"#
);

abigen!(
    TicketToken,
    r#"[
        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId)
        function ownerOf(uint256 tokenId) view returns (address)
    ]"#
);

abigen!(
    QuizRegistry,
    r#"[
        function quizEndsLength() view returns (uint256)
        function distributionsLength() view returns (uint256)
        function getQuizEnd(uint256 index) view returns (uint256 id, string title, string question, string[] options, uint8 correctOption, uint256 participants, uint256 correctCount, address winner1, address winner2, address winner3, bytes32 seed, uint64 endedAt, address source)
        function getDistribution(uint256 index) view returns (address winner1, address winner2, address winner3, uint256 amount1, uint256 amount2, uint256 amount3, bytes32 tx1, bytes32 tx2, bytes32 tx3, bytes32 seed, uint64 distributedAt, address source)
    ]"#
);

abigen!(
    QuizGame,
    r#"[
        function historyLength() view returns (uint256)
        function getHistory(uint256 index) view returns (uint256 id, string title, string question, string[] options, uint8 correctOption, uint256 participants, uint256 correctCount, uint64 endedAt)
    ]"#
);
