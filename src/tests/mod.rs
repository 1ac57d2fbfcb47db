mod multicall_tests;
