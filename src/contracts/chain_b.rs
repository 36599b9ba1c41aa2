use alloy::sol;

sol! {
    /// Bridge contract on chain B. Reads cover asset mapping, replay
    /// protection, and the validator set; writes submit releases with the
    /// aggregated signature list.
    #[sol(rpc)]
    contract BridgeB {
        function wavesToUnit0Token(string wavesAssetId) external view returns (address);
        function processedTransfers(bytes32 transferId) external view returns (bool);
        function validatorThreshold() external view returns (uint256);
        function activeValidatorCount() external view returns (uint256);
        function isValidator(address account) external view returns (bool);

        function releaseTokens(
            bytes32 transferId,
            address token,
            uint256 amount,
            address recipient,
            uint8 tokenKind,
            uint256 tokenId,
            bytes[] signatures
        ) external;

        function releaseNFT(
            bytes32 transferId,
            address token,
            address recipient,
            uint256 tokenId,
            bytes[] signatures
        ) external;
    }
}
