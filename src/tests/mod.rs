mod transaction_tests;
